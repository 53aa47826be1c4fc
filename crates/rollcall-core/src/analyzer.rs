//! Face analysis seam: detection plus embedding for every face in a frame.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::DetectedFace;
use image::RgbImage;
use std::path::Path;
use thiserror::Error;

/// File name of the SCRFD detection model inside the model directory.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// File name of the ArcFace recognition model inside the model directory.
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Finds faces in an RGB frame and embeds each one.
///
/// Faces come back sorted by detection confidence, highest first.
pub trait FaceAnalyzer {
    fn analyze(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, AnalyzerError>;
}

impl<T: FaceAnalyzer + ?Sized> FaceAnalyzer for &mut T {
    fn analyze(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, AnalyzerError> {
        (**self).analyze(image)
    }
}

impl<T: FaceAnalyzer + ?Sized> FaceAnalyzer for Box<T> {
    fn analyze(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, AnalyzerError> {
        (**self).analyze(image)
    }
}

/// SCRFD + ArcFace analyzer backed by ONNX Runtime.
pub struct OnnxAnalyzer {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxAnalyzer {
    pub fn new(detector: FaceDetector, recognizer: FaceRecognizer) -> Self {
        Self {
            detector,
            recognizer,
        }
    }

    /// Load both models from `model_dir`, failing fast if either is missing.
    pub fn load(model_dir: &Path) -> Result<Self, AnalyzerError> {
        let detector = FaceDetector::load(&model_dir.join(DETECTOR_MODEL_FILE))?;
        let recognizer = FaceRecognizer::load(&model_dir.join(RECOGNIZER_MODEL_FILE))?;
        Ok(Self::new(detector, recognizer))
    }
}

impl FaceAnalyzer for OnnxAnalyzer {
    fn analyze(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, AnalyzerError> {
        let boxes = self.detector.detect(image)?;
        tracing::trace!(faces = boxes.len(), "detection pass");

        boxes
            .into_iter()
            .map(|bbox| {
                let embedding = self.recognizer.extract(image, &bbox)?;
                Ok(DetectedFace { bbox, embedding })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_reports_missing_detector_first() {
        let dir = tempfile::tempdir().unwrap();
        let err = OnnxAnalyzer::load(dir.path()).err().unwrap();
        assert!(matches!(
            err,
            AnalyzerError::Detector(DetectorError::ModelNotFound(ref p)) if p.ends_with(DETECTOR_MODEL_FILE)
        ));
    }
}
