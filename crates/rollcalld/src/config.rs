use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::{ReadRetry, StreamSettings};

/// Server configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP server listens on (default: 0.0.0.0:5000).
    pub bind_addr: SocketAddr,
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Requested capture width in pixels.
    pub frame_width: u32,
    /// Requested capture height in pixels.
    pub frame_height: u32,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Reference photos, one subdirectory per person.
    pub known_faces_dir: PathBuf,
    /// Gallery cache written after the first scan.
    pub gallery_cache: PathBuf,
    /// Attendance CSV.
    pub ledger_path: PathBuf,
    /// Euclidean distance below which a face matches.
    pub match_threshold: f32,
    /// Analyze one frame out of this many.
    pub analyze_every: u32,
    /// Emit throttled frames unannotated instead of dropping them.
    pub stream_all_frames: bool,
    /// JPEG quality for streamed frames (1-100).
    pub jpeg_quality: u8,
    /// Consecutive failed reads tolerated before a stream gives up.
    pub read_retries: u32,
    /// Delay before the first retry; doubles up to 500ms.
    pub read_backoff: Duration,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let path = |key: &str, default: &str| {
            lookup(key)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(default))
        };

        Self {
            bind_addr: parse(&lookup, "ROLLCALL_BIND")
                .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 5000))),
            camera_device: lookup("ROLLCALL_CAMERA_DEVICE")
                .unwrap_or_else(|| "/dev/video0".to_string()),
            frame_width: parse(&lookup, "ROLLCALL_FRAME_WIDTH").unwrap_or(640),
            frame_height: parse(&lookup, "ROLLCALL_FRAME_HEIGHT").unwrap_or(480),
            model_dir: lookup("ROLLCALL_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(rollcall_core::default_model_dir),
            known_faces_dir: path("ROLLCALL_KNOWN_FACES_DIR", "known_faces"),
            gallery_cache: path("ROLLCALL_GALLERY_CACHE", "encodings.msgpack"),
            ledger_path: path("ROLLCALL_LEDGER_PATH", "attendance.csv"),
            match_threshold: parse(&lookup, "ROLLCALL_MATCH_THRESHOLD").unwrap_or(0.5),
            analyze_every: parse(&lookup, "ROLLCALL_ANALYZE_EVERY")
                .filter(|&n: &u32| n > 0)
                .unwrap_or(5),
            stream_all_frames: lookup("ROLLCALL_STREAM_ALL_FRAMES")
                .map(|v| v != "0")
                .unwrap_or(false),
            jpeg_quality: parse(&lookup, "ROLLCALL_JPEG_QUALITY")
                .map(|q: u8| q.clamp(1, 100))
                .unwrap_or(80),
            read_retries: parse(&lookup, "ROLLCALL_READ_RETRIES").unwrap_or(10),
            read_backoff: Duration::from_millis(
                parse(&lookup, "ROLLCALL_READ_BACKOFF_MS").unwrap_or(10),
            ),
        }
    }

    /// Recognition loop settings derived from this configuration.
    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            match_threshold: self.match_threshold,
            analyze_every: self.analyze_every,
            stream_all_frames: self.stream_all_frames,
            jpeg_quality: self.jpeg_quality,
            retry: ReadRetry {
                max_attempts: self.read_retries,
                initial_backoff: self.read_backoff,
                max_backoff: Duration::from_millis(500),
            },
        }
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}
