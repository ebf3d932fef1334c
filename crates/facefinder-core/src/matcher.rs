//! Match engine: search a photo set for the target face.
//!
//! Candidates are processed sequentially in input order. A photo's distance
//! is the minimum over every face found in it, so the result does not
//! depend on detector ordering. Photos that cannot be read, contain no
//! face, or make the oracle fail are skipped with a [`Diagnostic`]; they
//! never abort the batch.

use crate::oracle::{EmbeddingOracle, OracleError};
use crate::types::{confidence_for, CandidatePhoto, Embedding, MatchRecord, MatchThreshold};
use image::imageops::FilterType;
use image::DynamicImage;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;

pub const DEFAULT_CACHE_CAPACITY: usize = 4096;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("unreadable image: {0}")]
    UnreadableImage(String),
    #[error("downscale factor must be at least 1")]
    InvalidDownscale,
    #[error("oracle: {0}")]
    Oracle(#[from] OracleError),
    #[error("match run cancelled after {done} of {total} photos")]
    Cancelled { done: usize, total: usize },
}

/// Per-run knobs, captured by value when a run starts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MatchOptions {
    pub threshold: MatchThreshold,
    /// Both photo dimensions are divided by this (truncating) before
    /// detection. Faster, but small or distant faces may be missed.
    pub downscale_factor: u32,
}

impl MatchOptions {
    pub fn new(threshold: MatchThreshold) -> Self {
        Self {
            threshold,
            downscale_factor: 1,
        }
    }

    pub fn with_downscale(mut self, factor: u32) -> Self {
        self.downscale_factor = factor;
        self
    }
}

/// Why a candidate was skipped.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    UnreadableImage { index: usize, filename: String, reason: String },
    NoFaceDetected { index: usize, filename: String },
    OracleFailed { index: usize, filename: String, reason: String },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::UnreadableImage { filename, reason, .. } => {
                write!(f, "{filename}: unreadable image ({reason})")
            }
            Diagnostic::NoFaceDetected { filename, .. } => write!(f, "{filename}: no face detected"),
            Diagnostic::OracleFailed { filename, reason, .. } => {
                write!(f, "{filename}: face extraction failed ({reason})")
            }
        }
    }
}

/// Side channel of a match run.
pub trait MatchObserver {
    /// Called after each candidate with `done` in `1..=total`.
    fn progress(&mut self, _done: usize, _total: usize) {}

    fn diagnostic(&mut self, _diagnostic: Diagnostic) {}

    /// Checked before each candidate; returning true cancels the run.
    fn should_stop(&self) -> bool {
        false
    }
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl MatchObserver for NoopObserver {}

type CacheKey = ([u8; 32], u32);

/// Embeddings per (photo content, downscale factor), least recently used
/// entry evicted when full.
struct FaceCache {
    entries: HashMap<CacheKey, (Arc<Vec<Embedding>>, u64)>,
    capacity: usize,
    tick: u64,
}

impl FaceCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
            tick: 0,
        }
    }

    fn get(&mut self, key: &CacheKey) -> Option<Arc<Vec<Embedding>>> {
        self.tick += 1;
        let tick = self.tick;
        self.entries.get_mut(key).map(|(faces, used)| {
            *used = tick;
            faces.clone()
        })
    }

    fn insert(&mut self, key: CacheKey, faces: Vec<Embedding>) -> Arc<Vec<Embedding>> {
        let faces = Arc::new(faces);
        if self.capacity == 0 {
            return faces;
        }
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            let oldest = self.entries.iter().min_by_key(|(_, (_, used))| *used).map(|(k, _)| *k);
            if let Some(oldest) = oldest {
                self.entries.remove(&oldest);
            }
        }
        self.tick += 1;
        self.entries.insert(key, (faces.clone(), self.tick));
        faces
    }
}

enum Skip {
    Unreadable(String),
    Oracle(OracleError),
}

/// Owns the oracle and the face cache for its lifetime.
pub struct MatchEngine<O> {
    oracle: O,
    cache: FaceCache,
}

impl<O: EmbeddingOracle> MatchEngine<O> {
    pub fn new(oracle: O) -> Self {
        Self::with_cache_capacity(oracle, DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_cache_capacity(oracle: O, capacity: usize) -> Self {
        Self {
            oracle,
            cache: FaceCache::new(capacity),
        }
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    pub fn cached_photos(&self) -> usize {
        self.cache.entries.len()
    }

    pub fn clear_cache(&mut self) {
        self.cache.entries.clear();
    }

    /// Embedding of the most confident face in a target image.
    ///
    /// `Ok(None)` means no face was found; the caller should ask for another
    /// image. Only undecodable input or an oracle failure is an error.
    pub fn extract_primary_embedding(&mut self, image_bytes: &[u8]) -> Result<Option<Embedding>, MatchError> {
        let image = decode(image_bytes).map_err(MatchError::UnreadableImage)?;
        let faces = self.oracle.locate_faces(&image)?;
        let Some(primary) = faces.first() else {
            tracing::debug!("no face in target image");
            return Ok(None);
        };
        let embeddings = self.oracle.embed_faces(&image, std::slice::from_ref(primary))?;
        Ok(embeddings.into_iter().next())
    }

    /// Matched candidates, in candidate order.
    pub fn find_matches(
        &mut self,
        target: &Embedding,
        candidates: &[CandidatePhoto],
        options: &MatchOptions,
        observer: &mut dyn MatchObserver,
    ) -> Result<Vec<MatchRecord>, MatchError> {
        if options.downscale_factor == 0 {
            return Err(MatchError::InvalidDownscale);
        }

        let total = candidates.len();
        let mut matches = Vec::new();

        for (index, photo) in candidates.iter().enumerate() {
            if observer.should_stop() {
                tracing::info!(done = index, total, "match run cancelled");
                return Err(MatchError::Cancelled { done: index, total });
            }

            match self.faces_in(photo, options.downscale_factor) {
                Ok(faces) => match evaluate(index, &photo.filename, target, &faces, options.threshold) {
                    Some(record) => {
                        tracing::debug!(
                            file = %photo.filename,
                            distance = record.distance,
                            faces = record.face_count,
                            matched = record.matched,
                            "compared photo"
                        );
                        if record.matched {
                            matches.push(record);
                        }
                    }
                    None => {
                        tracing::debug!(file = %photo.filename, "no face in photo");
                        observer.diagnostic(Diagnostic::NoFaceDetected {
                            index,
                            filename: photo.filename.clone(),
                        });
                    }
                },
                Err(Skip::Unreadable(reason)) => {
                    tracing::warn!(file = %photo.filename, %reason, "skipping unreadable photo");
                    observer.diagnostic(Diagnostic::UnreadableImage {
                        index,
                        filename: photo.filename.clone(),
                        reason,
                    });
                }
                Err(Skip::Oracle(err)) => {
                    tracing::warn!(file = %photo.filename, error = %err, "face extraction failed; skipping photo");
                    observer.diagnostic(Diagnostic::OracleFailed {
                        index,
                        filename: photo.filename.clone(),
                        reason: err.to_string(),
                    });
                }
            }

            observer.progress(index + 1, total);
        }

        Ok(matches)
    }

    fn faces_in(&mut self, photo: &CandidatePhoto, factor: u32) -> Result<Arc<Vec<Embedding>>, Skip> {
        let key = (photo.content_hash, factor);
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit);
        }

        let image = downscale(decode(&photo.bytes).map_err(Skip::Unreadable)?, factor);
        let boxes = self.oracle.locate_faces(&image).map_err(Skip::Oracle)?;
        let faces = if boxes.is_empty() {
            Vec::new()
        } else {
            self.oracle.embed_faces(&image, &boxes).map_err(Skip::Oracle)?
        };
        Ok(self.cache.insert(key, faces))
    }
}

/// Score one photo's faces against the target. `None` if it has no faces.
pub fn evaluate(
    index: usize,
    filename: &str,
    target: &Embedding,
    faces: &[Embedding],
    threshold: MatchThreshold,
) -> Option<MatchRecord> {
    let distance = faces
        .iter()
        .map(|face| target.distance(face))
        .min_by(|a, b| a.total_cmp(b))?;

    Some(MatchRecord {
        index,
        filename: filename.to_string(),
        distance,
        confidence: confidence_for(distance),
        matched: threshold.accepts(distance),
        face_count: faces.len(),
    })
}

/// Shrink both dimensions by `factor`, truncating, never below one pixel.
pub fn downscale(image: DynamicImage, factor: u32) -> DynamicImage {
    if factor <= 1 {
        return image;
    }
    let width = (image.width() / factor).max(1);
    let height = (image.height() / factor).max(1);
    image.resize_exact(width, height, FilterType::Triangle)
}

// Decoders are third-party code fed untrusted bytes; a panic there is
// reported like any other decode failure.
fn decode(bytes: &[u8]) -> Result<DynamicImage, String> {
    match panic::catch_unwind(AssertUnwindSafe(|| image::load_from_memory(bytes))) {
        Ok(Ok(image)) => Ok(image),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("decoder panicked".to_string()),
    }
}
