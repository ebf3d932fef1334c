//! The embedding oracle: image in, face locations and embeddings out.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{Embedding, FaceBox, ThresholdRange};
use image::DynamicImage;
use std::path::Path;
use thiserror::Error;

pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum OracleError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("{0}")]
    Other(String),
}

/// Face location and embedding extraction.
///
/// Implementations must be pure functions of the image: no state carried
/// between calls may change a result.
pub trait EmbeddingOracle {
    /// Faces in `image`, most confident first.
    fn locate_faces(&mut self, image: &DynamicImage) -> Result<Vec<FaceBox>, OracleError>;

    /// One embedding per face, in the order of `faces`.
    fn embed_faces(&mut self, image: &DynamicImage, faces: &[FaceBox]) -> Result<Vec<Embedding>, OracleError>;
}

impl<O: EmbeddingOracle + ?Sized> EmbeddingOracle for Box<O> {
    fn locate_faces(&mut self, image: &DynamicImage) -> Result<Vec<FaceBox>, OracleError> {
        (**self).locate_faces(image)
    }

    fn embed_faces(&mut self, image: &DynamicImage, faces: &[FaceBox]) -> Result<Vec<Embedding>, OracleError> {
        (**self).embed_faces(image, faces)
    }
}

/// SCRFD + ArcFace on ONNX Runtime.
pub struct OnnxOracle {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxOracle {
    /// Threshold bounds calibrated for the recognizer's unit-length output.
    pub const THRESHOLD_RANGE: ThresholdRange = ThresholdRange::ARCFACE;

    /// Load both models from `model_dir`. Fails fast if either is missing.
    pub fn load(model_dir: &Path) -> Result<Self, OracleError> {
        let detector = FaceDetector::load(&model_dir.join(DETECTOR_MODEL_FILE))?;
        let recognizer = FaceRecognizer::load(&model_dir.join(RECOGNIZER_MODEL_FILE))?;
        Ok(Self { detector, recognizer })
    }
}

impl EmbeddingOracle for OnnxOracle {
    fn locate_faces(&mut self, image: &DynamicImage) -> Result<Vec<FaceBox>, OracleError> {
        Ok(self.detector.detect(&image.to_rgb8())?)
    }

    fn embed_faces(&mut self, image: &DynamicImage, faces: &[FaceBox]) -> Result<Vec<Embedding>, OracleError> {
        if faces.is_empty() {
            return Ok(Vec::new());
        }
        let rgb = image.to_rgb8();
        faces
            .iter()
            .map(|face| self.recognizer.extract(&rgb, face).map_err(OracleError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_pair(cos: f32) -> (Embedding, Embedding) {
        let mut a = vec![0.0f32; 512];
        let mut b = vec![0.0f32; 512];
        a[0] = 1.0;
        b[0] = cos;
        b[1] = (1.0 - cos * cos).sqrt();
        (Embedding::new(a), Embedding::new(b))
    }

    #[test]
    fn test_default_threshold_accepts_same_person_similarity() {
        let threshold = OnnxOracle::THRESHOLD_RANGE.default_threshold();
        for cos in [0.45, 0.6, 0.75, 0.85] {
            let (a, b) = unit_pair(cos);
            assert!(threshold.accepts(a.distance(&b)), "cos {cos} rejected");
        }
        let (a, b) = unit_pair(0.6);
        assert!((a.distance(&b) - 0.8944).abs() < 1e-3);
    }

    #[test]
    fn test_default_threshold_rejects_unrelated_faces() {
        let threshold = OnnxOracle::THRESHOLD_RANGE.default_threshold();
        for cos in [-0.2, 0.0, 0.2] {
            let (a, b) = unit_pair(cos);
            assert!(!threshold.accepts(a.distance(&b)), "cos {cos} accepted");
        }
    }
}
