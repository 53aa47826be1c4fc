//! Recognition loop: pulls camera frames, identifies faces against the
//! gallery, records attendance, and yields annotated JPEG frames.
//!
//! The loop is an [`Iterator`]. It owns the frame source and drops it as soon
//! as it stops, whether that is after recording attendance, after the camera
//! gives up, or because the consumer dropped the iterator.

use std::sync::Arc;
use std::time::Duration;

use rollcall_core::annotate::{self, ATTENDANCE_CAPTION, GREEN};
use rollcall_core::{DistanceMatcher, FaceAnalyzer, Gallery, Ledger, LedgerError, Matcher};
use rollcall_hw::{CameraError, Frame, FrameSource};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera read failed after {attempts} attempts: {source}")]
    Camera {
        attempts: u32,
        #[source]
        source: CameraError,
    },
    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),
    #[error("JPEG encode failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Bounded exponential backoff for camera reads.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadRetry {
    /// Total reads attempted for one frame before giving up.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl ReadRetry {
    /// Delay after the `attempt`-th consecutive failure (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub match_threshold: f32,
    pub analyze_every: u32,
    pub stream_all_frames: bool,
    pub jpeg_quality: u8,
    pub retry: ReadRetry,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            match_threshold: 0.5,
            analyze_every: 5,
            stream_all_frames: false,
            jpeg_quality: 80,
            retry: ReadRetry {
                max_attempts: 10,
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(500),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Streaming,
    Stopped,
}

/// Outcome for one face in an analyzed frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceLabel {
    pub label: String,
    pub distance: Option<f32>,
    pub already_marked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    /// Throttled frame emitted without analysis.
    PassThrough,
    Analyzed,
    /// Final frame: attendance was just recorded for this person.
    AttendanceTaken(String),
}

/// One encoded frame ready to stream.
#[derive(Debug, Clone)]
pub struct StreamFrame {
    pub jpeg: Vec<u8>,
    pub sequence: u32,
    pub kind: FrameKind,
    pub faces: Vec<FaceLabel>,
}

pub struct RecognitionStream<S, A> {
    source: Option<S>,
    analyzer: A,
    gallery: Arc<Gallery>,
    ledger: Ledger,
    matcher: DistanceMatcher,
    settings: StreamSettings,
    frames_read: u64,
}

impl<S: FrameSource, A: FaceAnalyzer> RecognitionStream<S, A> {
    pub fn new(
        source: S,
        analyzer: A,
        gallery: Arc<Gallery>,
        ledger: Ledger,
        settings: StreamSettings,
    ) -> Self {
        Self {
            source: Some(source),
            analyzer,
            gallery,
            ledger,
            matcher: DistanceMatcher::new(settings.match_threshold),
            settings,
            frames_read: 0,
        }
    }

    pub fn state(&self) -> StreamState {
        if self.source.is_some() {
            StreamState::Streaming
        } else {
            StreamState::Stopped
        }
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    /// Stop streaming and release the frame source. Idempotent.
    pub fn stop(&mut self) {
        if self.source.take().is_some() {
            tracing::debug!(frames_read = self.frames_read, "recognition stream stopped");
        }
    }

    /// Next frame from the source, retrying failed reads with backoff.
    fn read_frame(&mut self) -> Option<Result<Frame, EngineError>> {
        let retry = self.settings.retry;
        let source = self.source.as_mut()?;
        let mut attempt = 0u32;

        loop {
            match source.read_frame() {
                Ok(frame) => return Some(Ok(frame)),
                Err(err) => {
                    attempt += 1;
                    if attempt >= retry.max_attempts.max(1) {
                        return Some(Err(EngineError::Camera {
                            attempts: attempt,
                            source: err,
                        }));
                    }
                    let delay = retry.delay(attempt);
                    tracing::warn!(attempt, ?delay, error = %err, "camera read failed, retrying");
                    std::thread::sleep(delay);
                }
            }
        }
    }

    /// Identify every face in the frame and annotate it.
    ///
    /// `Ok(None)` means analysis failed and the frame is dropped.
    fn process(&mut self, frame: Frame) -> Result<Option<StreamFrame>, EngineError> {
        let Frame {
            mut image,
            sequence,
            ..
        } = frame;

        let faces = match self.analyzer.analyze(&image) {
            Ok(faces) => faces,
            Err(err) => {
                tracing::warn!(sequence, error = %err, "face analysis failed, skipping frame");
                return Ok(None);
            }
        };

        let mut kind = FrameKind::Analyzed;
        let mut labels = Vec::with_capacity(faces.len());

        for face in &faces {
            let result = self.matcher.compare(&face.embedding, &self.gallery);
            let mut already_marked = false;

            if let Some(name) = result.name.as_deref() {
                tracing::debug!(sequence, name, distance = ?result.distance, "face identified");
                if self.ledger.is_marked_today(name)? {
                    already_marked = true;
                } else {
                    self.ledger.mark_now(name)?;
                    annotate::draw_face(&mut image, &face.bbox, name, GREEN);
                    annotate::draw_caption(&mut image, ATTENDANCE_CAPTION, GREEN);
                    labels.push(FaceLabel {
                        label: name.to_string(),
                        distance: result.distance,
                        already_marked: false,
                    });
                    kind = FrameKind::AttendanceTaken(name.to_string());
                    break;
                }
            }

            annotate::draw_face(&mut image, &face.bbox, result.label(), GREEN);
            labels.push(FaceLabel {
                label: result.label().to_string(),
                distance: result.distance,
                already_marked,
            });
        }

        let jpeg = annotate::encode_jpeg(&image, self.settings.jpeg_quality)?;
        Ok(Some(StreamFrame {
            jpeg,
            sequence,
            kind,
            faces: labels,
        }))
    }

    fn pass_through(&self, frame: Frame) -> Result<StreamFrame, EngineError> {
        Ok(StreamFrame {
            jpeg: annotate::encode_jpeg(&frame.image, self.settings.jpeg_quality)?,
            sequence: frame.sequence,
            kind: FrameKind::PassThrough,
            faces: Vec::new(),
        })
    }
}

impl<S: FrameSource, A: FaceAnalyzer> Iterator for RecognitionStream<S, A> {
    type Item = Result<StreamFrame, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let frame = match self.read_frame()? {
                Ok(frame) => frame,
                Err(err) => {
                    self.stop();
                    return Some(Err(err));
                }
            };
            self.frames_read += 1;

            let result = if self.frames_read % u64::from(self.settings.analyze_every.max(1)) != 0 {
                if !self.settings.stream_all_frames {
                    continue;
                }
                self.pass_through(frame)
            } else {
                match self.process(frame) {
                    Ok(Some(processed)) => Ok(processed),
                    Ok(None) => continue,
                    Err(err) => Err(err),
                }
            };

            let finished = match &result {
                Ok(frame) => matches!(frame.kind, FrameKind::AttendanceTaken(_)),
                Err(_) => true,
            };
            if finished {
                self.stop();
            }
            return Some(result);
        }
    }
}
