use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance, accumulated in `f64`.
    ///
    /// Embeddings of different dimensionality are never comparable and
    /// report an infinite distance.
    pub fn distance(&self, other: &Embedding) -> f64 {
        if self.values.len() != other.values.len() {
            return f64::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(&a, &b)| {
                let d = f64::from(a) - f64::from(b);
                d * d
            })
            .sum::<f64>()
            .sqrt()
    }

    /// Little-endian `f32` byte layout used for persistence.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Inverse of [`to_le_bytes`](Self::to_le_bytes). Returns `None` when the
    /// byte length is not a multiple of four.
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self::new(values))
    }
}

/// Display confidence for a distance: `round((1 - d) * 100, 2)`.
///
/// Cosmetic only. Not clamped, so pathological distances can go below 0 or above 100.
pub fn confidence_for(distance: f64) -> f64 {
    round_to((1.0 - distance) * 100.0, 2)
}

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

#[derive(Error, Debug, PartialEq)]
pub enum ThresholdError {
    #[error("threshold {value} outside allowed range [{min}, {max}]")]
    OutOfRange { value: f64, min: f64, max: f64 },
    #[error("invalid threshold range: min={min} default={default} max={max}")]
    InvalidRange { min: f64, default: f64, max: f64 },
}

/// Allowed bounds for a session's match threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThresholdRange {
    pub min: f64,
    pub max: f64,
    pub default: f64,
}

impl ThresholdRange {
    /// Bounds for compact 128-dim encodings, where same-person distances sit near 0.4.
    pub const STANDARD: ThresholdRange = ThresholdRange {
        min: 0.30,
        max: 0.70,
        default: 0.50,
    };

    /// Bounds for L2-normalized ArcFace embeddings. On unit vectors
    /// d = sqrt(2 - 2 cos), so the default 1.1 accepts cosine similarity
    /// down to about 0.40.
    pub const ARCFACE: ThresholdRange = ThresholdRange {
        min: 0.80,
        max: 1.30,
        default: 1.10,
    };

    pub fn new(min: f64, max: f64, default: f64) -> Result<Self, ThresholdError> {
        let ordered = min > 0.0 && min <= default && default <= max;
        if !ordered || !max.is_finite() {
            return Err(ThresholdError::InvalidRange { min, default, max });
        }
        Ok(Self { min, max, default })
    }

    pub fn check(&self, value: f64) -> Result<MatchThreshold, ThresholdError> {
        if !(self.min..=self.max).contains(&value) {
            return Err(ThresholdError::OutOfRange {
                value,
                min: self.min,
                max: self.max,
            });
        }
        Ok(MatchThreshold(value))
    }

    pub fn default_threshold(&self) -> MatchThreshold {
        MatchThreshold(self.default)
    }
}

impl Default for ThresholdRange {
    fn default() -> Self {
        Self::STANDARD
    }
}

/// Maximum embedding distance at which two faces count as the same person.
/// Lower is stricter.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct MatchThreshold(f64);

impl MatchThreshold {
    /// Validate against [`ThresholdRange::STANDARD`].
    pub fn new(value: f64) -> Result<Self, ThresholdError> {
        ThresholdRange::STANDARD.check(value)
    }

    /// Wrap a value that was validated when it was first stored.
    pub fn from_stored(value: f64) -> Self {
        Self(value)
    }

    pub fn value(self) -> f64 {
        self.0
    }

    pub fn accepts(self, distance: f64) -> bool {
        distance <= self.0
    }
}

impl Default for MatchThreshold {
    fn default() -> Self {
        ThresholdRange::STANDARD.default_threshold()
    }
}

/// An uploaded photo searched for the target face.
///
/// Identity is the filename, which is not required to be unique.
#[derive(Debug, Clone)]
pub struct CandidatePhoto {
    pub filename: String,
    pub bytes: Arc<[u8]>,
    /// SHA-256 of `bytes`, key for the face cache.
    pub content_hash: [u8; 32],
    pub uploaded_at: DateTime<Utc>,
}

impl CandidatePhoto {
    pub fn new(filename: &str, bytes: Vec<u8>) -> Self {
        Self::with_uploaded_at(filename, bytes, Utc::now())
    }

    pub fn with_uploaded_at(filename: &str, bytes: Vec<u8>, uploaded_at: DateTime<Utc>) -> Self {
        let content_hash = Sha256::digest(&bytes).into();
        Self {
            filename: base_filename(filename),
            bytes: bytes.into(),
            content_hash,
            uploaded_at,
        }
    }
}

/// Strip any directory components from an uploaded filename.
pub fn base_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("").trim();
    if base.is_empty() || base == "." || base == ".." {
        "photo".to_string()
    } else {
        base.to_string()
    }
}

/// Outcome of comparing one candidate photo against the target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchRecord {
    /// Position of the photo in the candidate sequence.
    pub index: usize,
    pub filename: String,
    /// Minimum distance to the target over every face in the photo.
    pub distance: f64,
    pub confidence: f64,
    pub matched: bool,
    pub face_count: usize,
}

impl MatchRecord {
    /// Distance rounded to four decimals for display.
    pub fn display_distance(&self) -> f64 {
        round_to(self.distance, 4)
    }
}

/// One completed search, appended to a session's history.
#[derive(Debug, Clone, Serialize)]
pub struct MatchRun {
    #[serde(skip)]
    pub target_embedding: Embedding,
    pub target_label: String,
    pub threshold: MatchThreshold,
    pub matched_filenames: Vec<String>,
    pub detected_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_to_self_is_zero() {
        let a = Embedding::new(vec![0.1, -0.4, 0.7, 0.25]);
        assert_eq!(a.distance(&a), 0.0);
        assert_eq!(confidence_for(a.distance(&a)), 100.0);
    }

    #[test]
    fn test_distance_euclidean() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.distance(&b) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_distance_dimension_mismatch() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![0.0, 0.0, 0.0]);
        assert!(a.distance(&b).is_infinite());
    }

    #[test]
    fn test_confidence_formula() {
        assert_eq!(confidence_for(0.2), 80.0);
        assert_eq!(confidence_for(0.1234), 87.66);
        assert_eq!(confidence_for(1.5), -50.0);
        assert_eq!(confidence_for(-0.1), 110.0);
    }

    #[test]
    fn test_embedding_bytes() {
        let a = Embedding::new(vec![1.5, -2.25, 0.0]);
        let bytes = a.to_le_bytes();
        assert_eq!(bytes.len(), 12);
        assert_eq!(Embedding::from_le_bytes(&bytes), Some(a));
        assert_eq!(Embedding::from_le_bytes(&[0, 1, 2]), None);
    }

    #[test]
    fn test_threshold_bounds() {
        assert_eq!(MatchThreshold::default().value(), 0.50);
        assert!(MatchThreshold::new(0.30).is_ok());
        assert!(MatchThreshold::new(0.70).is_ok());
        assert!(matches!(
            MatchThreshold::new(0.71),
            Err(ThresholdError::OutOfRange { .. })
        ));
        assert!(MatchThreshold::new(f64::NAN).is_err());
    }

    #[test]
    fn test_threshold_accepts_inclusive() {
        let t = MatchThreshold::new(0.45).unwrap();
        assert!(t.accepts(0.45));
        assert!(t.accepts(0.2));
        assert!(!t.accepts(0.4500001));
    }

    #[test]
    fn test_arcface_range_is_valid() {
        let r = ThresholdRange::ARCFACE;
        assert_eq!(ThresholdRange::new(r.min, r.max, r.default), Ok(r));
        assert!(r.check(1.0).is_ok());
        assert!(MatchThreshold::new(1.0).is_err());
    }

    #[test]
    fn test_threshold_range_validation() {
        assert!(ThresholdRange::new(0.5, 1.2, 0.9).is_ok());
        assert!(ThresholdRange::new(0.0, 0.7, 0.5).is_err());
        assert!(ThresholdRange::new(0.3, 0.7, 0.8).is_err());
        let range = ThresholdRange::new(0.5, 1.2, 0.9).unwrap();
        assert!(range.check(1.1).is_ok());
        assert!(range.check(0.4).is_err());
    }

    #[test]
    fn test_candidate_filename_and_hash() {
        let a = CandidatePhoto::new("/home/me/pics/beach.jpg", vec![1, 2, 3]);
        let b = CandidatePhoto::new("beach.jpg", vec![1, 2, 3]);
        let c = CandidatePhoto::new("other.jpg", vec![1, 2, 4]);
        assert_eq!(a.filename, "beach.jpg");
        assert_eq!(a.content_hash, b.content_hash);
        assert_ne!(a.content_hash, c.content_hash);
    }

    #[test]
    fn test_base_filename() {
        assert_eq!(base_filename("C:\\photos\\a.png"), "a.png");
        assert_eq!(base_filename("../../etc/passwd"), "passwd");
        assert_eq!(base_filename("dir/"), "photo");
        assert_eq!(base_filename(".."), "photo");
    }

    #[test]
    fn test_display_distance() {
        let r = MatchRecord {
            index: 0,
            filename: "a.jpg".into(),
            distance: 0.123456,
            confidence: confidence_for(0.123456),
            matched: true,
            face_count: 1,
        };
        assert_eq!(r.display_distance(), 0.1235);
    }
}
