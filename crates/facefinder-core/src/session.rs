//! Session state machine.
//!
//! ```text
//! (no session) ──create/resume──▶ SessionActive ──capture_target──▶ TargetCaptured
//!                                      ▲                                  │
//!                                      │ threshold / upload / reset       │ begin_run + complete_run
//!                                      └──────────── ResultsReady ◀───────┘
//! ```
//!
//! A run is planned with [`Session::begin_run`], executed elsewhere, and
//! committed with [`Session::complete_run`]. Any input change in between
//! bumps the generation and makes the commit stale.

use crate::types::{CandidatePhoto, Embedding, MatchRecord, MatchRun, MatchThreshold};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum SessionError {
    #[error("no target face captured")]
    NoTarget,
    #[error("session inputs changed while the match run was in progress")]
    StaleRun,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    SessionActive,
    TargetCaptured,
    ResultsReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    Append,
    /// Wholesale re-upload.
    Replace,
}

#[derive(Debug, Clone)]
pub struct Target {
    pub embedding: Embedding,
    pub label: String,
}

/// Everything a match run needs, captured at planning time.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub generation: u64,
    pub target: Target,
    pub photos: Vec<CandidatePhoto>,
    pub threshold: MatchThreshold,
}

#[derive(Debug, Clone)]
struct Results {
    records: Vec<MatchRecord>,
    threshold: MatchThreshold,
}

#[derive(Debug)]
pub struct Session {
    id: String,
    created_at: DateTime<Utc>,
    threshold: MatchThreshold,
    photos: Vec<CandidatePhoto>,
    target: Option<Target>,
    results: Option<Results>,
    generation: u64,
}

impl Session {
    /// New session with a fresh UUID.
    pub fn create(threshold: MatchThreshold) -> Self {
        Self::resume(uuid::Uuid::new_v4().to_string(), Utc::now(), threshold, Vec::new())
    }

    /// Rebuild a stored session. Starts without target or results.
    pub fn resume(
        id: String,
        created_at: DateTime<Utc>,
        threshold: MatchThreshold,
        photos: Vec<CandidatePhoto>,
    ) -> Self {
        Self {
            id,
            created_at,
            threshold,
            photos,
            target: None,
            results: None,
            generation: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn threshold(&self) -> MatchThreshold {
        self.threshold
    }

    pub fn photos(&self) -> &[CandidatePhoto] {
        &self.photos
    }

    pub fn target(&self) -> Option<&Target> {
        self.target.as_ref()
    }

    pub fn phase(&self) -> Phase {
        match (&self.target, &self.results) {
            (_, Some(_)) => Phase::ResultsReady,
            (Some(_), None) => Phase::TargetCaptured,
            (None, None) => Phase::SessionActive,
        }
    }

    /// Current matches, if a run has completed since the last input change.
    pub fn results(&self) -> Option<&[MatchRecord]> {
        self.results.as_ref().map(|r| r.records.as_slice())
    }

    /// Threshold the current results were computed with.
    pub fn results_threshold(&self) -> Option<MatchThreshold> {
        self.results.as_ref().map(|r| r.threshold)
    }

    pub fn set_threshold(&mut self, threshold: MatchThreshold) {
        self.threshold = threshold;
        self.invalidate();
    }

    pub fn upload(&mut self, photos: Vec<CandidatePhoto>, mode: UploadMode) {
        match mode {
            UploadMode::Append => self.photos.extend(photos),
            UploadMode::Replace => self.photos = photos,
        }
        self.invalidate();
    }

    /// Record a successfully extracted target. Discards any current results.
    pub fn capture_target(&mut self, embedding: Embedding, label: impl Into<String>) {
        self.results = None;
        self.generation += 1;
        self.target = Some(Target {
            embedding,
            label: label.into(),
        });
    }

    /// Back to SessionActive. Persisted history is not touched.
    pub fn reset(&mut self) {
        self.invalidate();
    }

    pub fn begin_run(&self) -> Result<RunPlan, SessionError> {
        let target = self.target.clone().ok_or(SessionError::NoTarget)?;
        Ok(RunPlan {
            generation: self.generation,
            target,
            photos: self.photos.clone(),
            threshold: self.threshold,
        })
    }

    /// Enter ResultsReady. Returns the history entry to persist when at
    /// least one photo matched.
    pub fn complete_run(
        &mut self,
        plan: RunPlan,
        records: Vec<MatchRecord>,
    ) -> Result<Option<MatchRun>, SessionError> {
        if plan.generation != self.generation || self.target.is_none() {
            return Err(SessionError::StaleRun);
        }

        let run = (!records.is_empty()).then(|| MatchRun {
            target_embedding: plan.target.embedding,
            target_label: plan.target.label,
            threshold: plan.threshold,
            matched_filenames: records.iter().map(|r| r.filename.clone()).collect(),
            detected_at: Utc::now(),
        });

        self.results = Some(Results {
            records,
            threshold: plan.threshold,
        });
        Ok(run)
    }

    /// Photos behind the current matches, in result order.
    pub fn matched_photos(&self) -> Vec<&CandidatePhoto> {
        self.results()
            .unwrap_or_default()
            .iter()
            .filter_map(|r| self.photos.get(r.index))
            .collect()
    }

    fn invalidate(&mut self) {
        self.target = None;
        self.results = None;
        self.generation += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::tests::{png, ColorOracle};
    use crate::matcher::{MatchEngine, MatchOptions, NoopObserver};

    fn record(index: usize, filename: &str, distance: f64) -> MatchRecord {
        crate::matcher::evaluate(
            index,
            filename,
            &Embedding::new(vec![0.0]),
            &[Embedding::new(vec![distance as f32])],
            MatchThreshold::default(),
        )
        .unwrap()
    }

    fn session_with_photos() -> Session {
        let mut session = Session::create(MatchThreshold::default());
        session.upload(
            vec![
                CandidatePhoto::new("a.jpg", vec![1]),
                CandidatePhoto::new("b.jpg", vec![2]),
                CandidatePhoto::new("c.jpg", vec![3]),
            ],
            UploadMode::Append,
        );
        session
    }

    #[test]
    fn test_full_cycle() {
        let mut session = session_with_photos();
        assert_eq!(session.phase(), Phase::SessionActive);
        assert_eq!(session.begin_run().unwrap_err(), SessionError::NoTarget);

        session.capture_target(Embedding::new(vec![0.0]), "me.jpg");
        assert_eq!(session.phase(), Phase::TargetCaptured);

        let plan = session.begin_run().unwrap();
        assert_eq!(plan.photos.len(), 3);
        let run = session
            .complete_run(plan, vec![record(0, "a.jpg", 0.1), record(2, "c.jpg", 0.3)])
            .unwrap()
            .expect("matches produce a history entry");

        assert_eq!(session.phase(), Phase::ResultsReady);
        assert_eq!(run.target_label, "me.jpg");
        assert_eq!(run.matched_filenames, vec!["a.jpg", "c.jpg"]);
        assert_eq!(run.threshold, MatchThreshold::default());

        let matched: Vec<&str> = session.matched_photos().iter().map(|p| p.filename.as_str()).collect();
        assert_eq!(matched, vec!["a.jpg", "c.jpg"]);
    }

    #[test]
    fn test_no_matches_means_nothing_to_persist() {
        let mut session = session_with_photos();
        session.capture_target(Embedding::new(vec![0.0]), "me.jpg");
        let plan = session.begin_run().unwrap();
        assert!(session.complete_run(plan, Vec::new()).unwrap().is_none());
        assert_eq!(session.phase(), Phase::ResultsReady);
        assert_eq!(session.results(), Some(&[][..]));
    }

    #[test]
    fn test_threshold_change_clears_results_only_in_memory() {
        let mut session = session_with_photos();
        session.capture_target(Embedding::new(vec![0.0]), "me.jpg");
        let plan = session.begin_run().unwrap();
        let run = session.complete_run(plan, vec![record(1, "b.jpg", 0.2)]).unwrap();

        session.set_threshold(MatchThreshold::new(0.6).unwrap());
        assert_eq!(session.phase(), Phase::SessionActive);
        assert!(session.results().is_none());
        assert!(session.target().is_none());
        assert!(session.matched_photos().is_empty());
        // The entry handed out for persistence is unaffected.
        assert_eq!(run.unwrap().matched_filenames, vec!["b.jpg"]);
    }

    #[test]
    fn test_run_threshold_is_a_snapshot() {
        let mut session = session_with_photos();
        session.capture_target(Embedding::new(vec![0.0]), "me.jpg");
        let plan = session.begin_run().unwrap();
        assert_eq!(plan.threshold.value(), 0.5);
        session.complete_run(plan, vec![record(0, "a.jpg", 0.1)]).unwrap();
        assert_eq!(session.results_threshold(), Some(MatchThreshold::default()));
    }

    #[test]
    fn test_input_change_during_run_is_stale() {
        let mut session = session_with_photos();
        session.capture_target(Embedding::new(vec![0.0]), "me.jpg");
        let plan = session.begin_run().unwrap();

        session.upload(vec![CandidatePhoto::new("d.jpg", vec![4])], UploadMode::Append);
        assert_eq!(
            session.complete_run(plan, vec![record(0, "a.jpg", 0.1)]).unwrap_err(),
            SessionError::StaleRun
        );
        assert_eq!(session.phase(), Phase::SessionActive);
    }

    #[test]
    fn test_recapture_during_run_is_stale() {
        let mut session = session_with_photos();
        session.capture_target(Embedding::new(vec![0.0]), "first.jpg");
        let plan = session.begin_run().unwrap();
        session.capture_target(Embedding::new(vec![1.0]), "second.jpg");
        assert_eq!(session.complete_run(plan, Vec::new()).unwrap_err(), SessionError::StaleRun);
        assert_eq!(session.phase(), Phase::TargetCaptured);
    }

    #[test]
    fn test_new_target_discards_results() {
        let mut session = session_with_photos();
        session.capture_target(Embedding::new(vec![0.0]), "me.jpg");
        let plan = session.begin_run().unwrap();
        session.complete_run(plan, vec![record(0, "a.jpg", 0.1)]).unwrap();

        session.capture_target(Embedding::new(vec![0.5]), "other.jpg");
        assert_eq!(session.phase(), Phase::TargetCaptured);
        assert!(session.results().is_none());
    }

    #[test]
    fn test_replace_upload() {
        let mut session = session_with_photos();
        session.upload(vec![CandidatePhoto::new("z.jpg", vec![9])], UploadMode::Replace);
        assert_eq!(session.photos().len(), 1);
        assert_eq!(session.photos()[0].filename, "z.jpg");
    }

    #[test]
    fn test_resume_empty_stays_pre_target() {
        let session = Session::resume("abc".into(), Utc::now(), MatchThreshold::default(), Vec::new());
        assert_eq!(session.id(), "abc");
        assert!(session.photos().is_empty());
        assert_eq!(session.phase(), Phase::SessionActive);
        assert!(session.begin_run().is_err());
    }

    #[test]
    fn test_reset() {
        let mut session = session_with_photos();
        session.capture_target(Embedding::new(vec![0.0]), "me.jpg");
        session.reset();
        assert_eq!(session.phase(), Phase::SessionActive);
        assert_eq!(session.photos().len(), 3);
    }

    #[test]
    fn test_with_engine() {
        let red = [200, 20, 20];
        let oracle = ColorOracle::default().with_faces(red, vec![vec![0.1, 0.0]]);
        let mut engine = MatchEngine::new(oracle);

        let mut session = Session::create(MatchThreshold::new(0.45).unwrap());
        session.upload(
            vec![CandidatePhoto::new("x.png", png([0, 0, 0], 4, 4)), CandidatePhoto::new("y.png", png(red, 4, 4))],
            UploadMode::Append,
        );
        let target = engine.extract_primary_embedding(&png(red, 4, 4)).unwrap().unwrap();
        session.capture_target(target, "camera");

        let plan = session.begin_run().unwrap();
        let options = MatchOptions::new(plan.threshold);
        let records = engine
            .find_matches(&plan.target.embedding, &plan.photos, &options, &mut NoopObserver)
            .unwrap();
        let run = session.complete_run(plan, records).unwrap().unwrap();
        assert_eq!(run.matched_filenames, vec!["y.png"]);
        assert_eq!(session.matched_photos()[0].filename, "y.png");
    }
}
