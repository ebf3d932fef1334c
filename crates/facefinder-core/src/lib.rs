//! facefinder-core: search a photo set for one person's face.
//!
//! Faces are located with SCRFD and embedded with ArcFace, both on ONNX
//! Runtime. A photo matches when any face in it lies within the session's
//! Euclidean distance threshold of the target embedding.

pub mod alignment;
pub mod archive;
pub mod detector;
pub mod matcher;
pub mod oracle;
pub mod recognizer;
pub mod session;
pub mod types;

use std::path::PathBuf;

pub use archive::{archive_bytes, write_archive, ArchiveError};
pub use detector::FaceDetector;
pub use matcher::{Diagnostic, MatchEngine, MatchError, MatchObserver, MatchOptions, NoopObserver};
pub use oracle::{EmbeddingOracle, OnnxOracle, OracleError};
pub use recognizer::FaceRecognizer;
pub use session::{Phase, RunPlan, Session, SessionError, UploadMode};
pub use types::{
    CandidatePhoto, Embedding, FaceBox, MatchRecord, MatchRun, MatchThreshold, ThresholdError, ThresholdRange,
};

/// `$XDG_DATA_HOME/facefinder`, falling back to `~/.local/share/facefinder`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facefinder")
}

/// Where `det_10g.onnx` and `w600k_r50.onnx` are looked up by default.
pub fn default_model_dir() -> PathBuf {
    default_data_dir().join("models")
}
