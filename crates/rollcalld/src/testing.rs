//! Fakes for the camera and the face analyzer.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use image::{Rgb, RgbImage};
use rollcall_core::detector::DetectorError;
use rollcall_core::{
    AnalyzerError, BoundingBox, DetectedFace, Embedding, FaceAnalyzer, Gallery, GalleryEntry,
    Ledger,
};
use rollcall_hw::{CameraError, Frame, FrameSource};

/// Shared view of a [`ScriptedSource`] that outlives it.
#[derive(Clone, Default)]
pub struct SourceProbe {
    reads: Arc<AtomicUsize>,
    released: Arc<AtomicBool>,
}

impl SourceProbe {
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

/// Frame source producing small grey frames, optionally failing some reads.
pub struct ScriptedSource {
    probe: SourceProbe,
    sequence: u32,
    fail_first: usize,
    always_fail: bool,
}

impl ScriptedSource {
    pub fn endless() -> Self {
        Self {
            probe: SourceProbe::default(),
            sequence: 0,
            fail_first: 0,
            always_fail: false,
        }
    }

    pub fn broken() -> Self {
        Self {
            always_fail: true,
            ..Self::endless()
        }
    }

    pub fn failing_first(mut self, reads: usize) -> Self {
        self.fail_first = reads;
        self
    }

    pub fn probe(&self) -> SourceProbe {
        self.probe.clone()
    }
}

impl FrameSource for ScriptedSource {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        let n = self.probe.reads.fetch_add(1, Ordering::SeqCst);
        if self.always_fail || n < self.fail_first {
            return Err(CameraError::CaptureFailed("scripted failure".into()));
        }
        self.sequence += 1;
        Ok(Frame::new(
            RgbImage::from_pixel(64, 48, Rgb([90, 90, 90])),
            self.sequence,
        ))
    }
}

impl Drop for ScriptedSource {
    fn drop(&mut self) {
        self.probe.released.store(true, Ordering::SeqCst);
    }
}

/// Analyzer that reports the same faces for every frame.
pub struct FixedAnalyzer {
    faces: Vec<DetectedFace>,
    fail_first: usize,
    calls: Arc<AtomicUsize>,
}

impl FixedAnalyzer {
    pub fn faces(faces: Vec<DetectedFace>) -> Self {
        Self {
            faces,
            fail_first: 0,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing_first(mut self, calls: usize) -> Self {
        self.fail_first = calls;
        self
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl FaceAnalyzer for FixedAnalyzer {
    fn analyze(&mut self, _image: &RgbImage) -> Result<Vec<DetectedFace>, AnalyzerError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_first {
            return Err(DetectorError::InferenceFailed("scripted failure".into()).into());
        }
        Ok(self.faces.clone())
    }
}

/// A face whose embedding sits `distance` away from the gallery origin.
pub fn probe(distance: f32) -> DetectedFace {
    DetectedFace {
        bbox: BoundingBox {
            x: 10.0,
            y: 8.0,
            width: 20.0,
            height: 24.0,
            confidence: 0.9,
            landmarks: None,
        },
        embedding: Embedding::new(vec![distance, 0.0]),
    }
}

/// One-person gallery with an embedding at the origin.
pub fn gallery_with(name: &str) -> Arc<Gallery> {
    Arc::new(Gallery::from_entries(vec![GalleryEntry {
        name: name.to_string(),
        embedding: Embedding::new(vec![0.0, 0.0]),
    }]))
}

pub fn ledger_in() -> (tempfile::TempDir, Ledger) {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Ledger::new(dir.path().join("attendance.csv"));
    (dir, ledger)
}

pub fn ledger_rows(path: &Path) -> usize {
    std::fs::read_to_string(path)
        .map(|s| s.lines().count())
        .unwrap_or(0)
}
