//! rollcall-core — face recognition and attendance bookkeeping.
//!
//! Detection (SCRFD) and embedding (ArcFace) run through ONNX Runtime behind
//! the [`FaceAnalyzer`] seam. The gallery of known faces, the attendance
//! ledger, and frame annotation live here so the server and CLI share them.

pub mod alignment;
pub mod analyzer;
pub mod annotate;
pub mod detector;
pub mod gallery;
pub mod ledger;
pub mod recognizer;
pub mod types;

pub use analyzer::{AnalyzerError, FaceAnalyzer, OnnxAnalyzer};
pub use gallery::{load_gallery, rebuild_gallery, Gallery, GalleryEntry, GalleryError, GallerySource};
pub use ledger::{AttendanceRecord, Ledger, LedgerError};
pub use types::{BoundingBox, DetectedFace, DistanceMatcher, Embedding, MatchResult, Matcher};

use std::path::PathBuf;

/// Model directory used when none is configured.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("models")
}
