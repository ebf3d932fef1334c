//! Per-action handlers over the in-memory sessions, the engine thread and the store.
//!
//! Sessions live in memory keyed by id and are restored from the store on
//! first use. Idle sessions are evicted and restored again on demand; a
//! restored session keeps its photos and threshold but not its target or
//! results. The engine is never awaited while the sessions lock is held.

use crate::config::Config;
use crate::engine::{EngineError, EngineHandle, MatchJob, ProgressSnapshot, RunProgress};
use chrono::{DateTime, Utc};
use facefinder_core::{
    archive_bytes, ArchiveError, CandidatePhoto, Diagnostic, MatchError, MatchOptions, MatchRecord, MatchRun,
    MatchThreshold, Phase, Session, SessionError, ThresholdError, ThresholdRange, UploadMode,
};
use facefinder_store::{SessionStore, SessionSummary, StoreError};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("session {0} not found or has no stored photos")]
    SessionNotFound(String),
    #[error(transparent)]
    Threshold(#[from] ThresholdError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("no face detected in the target image")]
    NoFaceDetected,
    #[error("unreadable image: {0}")]
    UnreadableImage(String),
    #[error("a match run is already in progress for session {0}")]
    RunInProgress(String),
    #[error("match run exceeded {0}s and was cancelled")]
    MatchTimeout(u64),
    #[error("match run cancelled after {done} of {total} photos")]
    Cancelled { done: usize, total: usize },
    #[error("no matched photos to export")]
    NoResults,
    #[error("camera: {0}")]
    Camera(String),
    #[error(transparent)]
    Engine(EngineError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

impl From<EngineError> for ServiceError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Match(MatchError::UnreadableImage(reason)) => Self::UnreadableImage(reason),
            EngineError::Match(MatchError::Cancelled { done, total }) => Self::Cancelled { done, total },
            other => Self::Engine(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub device: String,
    pub warmup_frames: usize,
    pub attempts: usize,
}

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub threshold_range: ThresholdRange,
    pub downscale_factor: u32,
    pub match_timeout: Duration,
    /// Resident sessions untouched for this long are evicted.
    pub session_idle: Duration,
    pub camera: Option<CameraSettings>,
}

impl ServiceSettings {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            threshold_range: config.threshold_range()?,
            downscale_factor: config.downscale_factor,
            match_timeout: config.match_timeout(),
            session_idle: config.session_idle(),
            camera: Some(CameraSettings {
                device: config.camera_device.clone(),
                warmup_frames: config.warmup_frames,
                attempts: config.snapshot_attempts,
            }),
        })
    }
}

/// Snapshot of one session for callers.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub phase: Phase,
    pub threshold: MatchThreshold,
    pub photo_count: usize,
    pub target_label: Option<String>,
    pub match_count: Option<usize>,
}

impl SessionInfo {
    fn of(session: &Session) -> Self {
        Self {
            session_id: session.id().to_string(),
            created_at: session.created_at(),
            phase: session.phase(),
            threshold: session.threshold(),
            photo_count: session.photos().len(),
            target_label: session.target().map(|t| t.label.clone()),
            match_count: session.results().map(<[MatchRecord]>::len),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadSummary {
    pub session: SessionInfo,
    pub added: usize,
    pub persisted: bool,
}

/// Outcome of one completed match run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub session_id: String,
    pub threshold: MatchThreshold,
    pub photos: usize,
    pub matches: Vec<MatchRecord>,
    pub diagnostics: Vec<Diagnostic>,
    /// Whether the history entry was stored. `None` when nothing matched.
    pub persisted: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultsView {
    pub session_id: String,
    pub phase: Phase,
    pub threshold: Option<MatchThreshold>,
    pub matches: Vec<MatchRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub version: &'static str,
    pub active_sessions: usize,
    pub running_matches: usize,
    pub cached_photos: Option<usize>,
    pub threshold_range: ThresholdRange,
    pub downscale_factor: u32,
    pub match_timeout_secs: u64,
    pub camera: Option<String>,
}

struct SessionSlot {
    session: Session,
    run: Option<Arc<RunProgress>>,
    last_used: Instant,
}

impl SessionSlot {
    fn new(session: Session) -> Self {
        Self {
            session,
            run: None,
            last_used: Instant::now(),
        }
    }

    fn is_running(&self) -> bool {
        self.run.as_ref().is_some_and(|r| r.is_running())
    }

    /// A handler or the engine still holds the run.
    fn run_in_flight(&self) -> bool {
        self.run.as_ref().is_some_and(|r| Arc::strong_count(r) > 1)
    }

    fn evictable(&self, now: Instant, idle: Duration) -> bool {
        !self.is_running() && !self.run_in_flight() && now.duration_since(self.last_used) >= idle
    }
}

type Sessions = HashMap<String, SessionSlot>;

pub struct FaceFinderService {
    store: SessionStore,
    engine: EngineHandle,
    settings: ServiceSettings,
    sessions: Mutex<Sessions>,
}

impl FaceFinderService {
    pub fn new(store: SessionStore, engine: EngineHandle, settings: ServiceSettings) -> Self {
        Self {
            store,
            engine,
            settings,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn create_session(&self) -> Result<SessionInfo, ServiceError> {
        let session = Session::create(self.settings.threshold_range.default_threshold());
        if let Err(e) = self
            .store
            .insert_session(session.id(), session.created_at(), session.threshold())
            .await
        {
            tracing::warn!(session = session.id(), error = %e, "failed to persist new session");
        }

        let info = SessionInfo::of(&session);
        tracing::info!(session = %info.session_id, threshold = info.threshold.value(), "session created");
        let mut sessions = self.sessions.lock().await;
        self.evict_idle(&mut sessions, &info.session_id);
        sessions.insert(info.session_id.clone(), SessionSlot::new(session));
        Ok(info)
    }

    /// Resume a stored session. A session without stored photos is not resumed.
    pub async fn load_session(&self, session_id: &str) -> Result<SessionInfo, ServiceError> {
        let mut sessions = self.resident(session_id).await?;
        let slot = slot_mut(&mut sessions, session_id)?;
        Ok(SessionInfo::of(&slot.session))
    }

    pub async fn list_sessions(&self, limit: usize) -> Result<Vec<SessionSummary>, ServiceError> {
        Ok(self.store.list_recent_sessions(limit).await?)
    }

    pub async fn upload_photos(
        &self,
        session_id: &str,
        files: Vec<(String, Vec<u8>)>,
        mode: UploadMode,
    ) -> Result<UploadSummary, ServiceError> {
        let photos: Vec<CandidatePhoto> = files
            .into_iter()
            .map(|(name, bytes)| CandidatePhoto::new(&name, bytes))
            .collect();
        let added = photos.len();

        let mut sessions = self.resident(session_id).await?;
        let slot = slot_mut(&mut sessions, session_id)?;

        let persisted = match self.persist_photos(&slot.session, photos.clone(), mode).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(session = session_id, error = %e, "failed to persist uploaded photos");
                false
            }
        };
        slot.session.upload(photos, mode);

        tracing::info!(
            session = session_id,
            added,
            total = slot.session.photos().len(),
            mode = ?mode,
            "photos uploaded"
        );
        Ok(UploadSummary {
            session: SessionInfo::of(&slot.session),
            added,
            persisted,
        })
    }

    async fn persist_photos(
        &self,
        session: &Session,
        photos: Vec<CandidatePhoto>,
        mode: UploadMode,
    ) -> Result<usize, StoreError> {
        self.store
            .insert_session(session.id(), session.created_at(), session.threshold())
            .await?;
        match mode {
            UploadMode::Append => self.store.insert_photos(session.id(), photos).await,
            UploadMode::Replace => self.store.replace_photos(session.id(), photos).await,
        }
    }

    pub async fn set_threshold(&self, session_id: &str, value: f64) -> Result<SessionInfo, ServiceError> {
        let threshold = self.settings.threshold_range.check(value)?;

        let mut sessions = self.resident(session_id).await?;
        let slot = slot_mut(&mut sessions, session_id)?;
        slot.session.set_threshold(threshold);
        if let Err(e) = self.store.update_threshold(session_id, threshold).await {
            tracing::warn!(session = session_id, error = %e, "failed to persist threshold");
        }

        tracing::info!(session = session_id, threshold = value, "threshold changed; results cleared");
        Ok(SessionInfo::of(&slot.session))
    }

    /// Extract the target face from `image`. On failure the session keeps its state.
    pub async fn capture_target(
        &self,
        session_id: &str,
        image: Vec<u8>,
        label: &str,
    ) -> Result<SessionInfo, ServiceError> {
        drop(self.resident(session_id).await?);

        let embedding = self
            .engine
            .extract_target(image)
            .await?
            .ok_or(ServiceError::NoFaceDetected)?;

        let mut sessions = self.resident(session_id).await?;
        let slot = slot_mut(&mut sessions, session_id)?;
        slot.session.capture_target(embedding, label);

        tracing::info!(session = session_id, label, "target captured");
        Ok(SessionInfo::of(&slot.session))
    }

    pub async fn capture_target_from_camera(&self, session_id: &str) -> Result<SessionInfo, ServiceError> {
        let camera = self
            .settings
            .camera
            .clone()
            .ok_or_else(|| ServiceError::Camera("no camera configured".into()))?;

        let png = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, String> {
            let cam = facefinder_hw::Camera::open(&camera.device).map_err(|e| e.to_string())?;
            let frame = cam
                .capture_snapshot(camera.warmup_frames, camera.attempts)
                .map_err(|e| e.to_string())?;
            frame.to_png().map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| ServiceError::Camera(e.to_string()))?
        .map_err(ServiceError::Camera)?;

        self.capture_target(session_id, png, "camera").await
    }

    /// Search every current photo for the target face.
    pub async fn run_match(&self, session_id: &str) -> Result<RunSummary, ServiceError> {
        let (plan, progress) = {
            let mut sessions = self.resident(session_id).await?;
            let slot = slot_mut(&mut sessions, session_id)?;
            if slot.is_running() {
                return Err(ServiceError::RunInProgress(session_id.to_string()));
            }
            let plan = slot.session.begin_run()?;
            let progress = Arc::new(RunProgress::new(plan.photos.len()));
            slot.run = Some(progress.clone());
            (plan, progress)
        };

        let job = MatchJob {
            target: plan.target.embedding.clone(),
            photos: plan.photos.clone(),
            options: MatchOptions::new(plan.threshold).with_downscale(self.settings.downscale_factor),
            progress: progress.clone(),
        };
        let photos = plan.photos.len();
        let threshold = plan.threshold;

        tracing::info!(session = session_id, photos, threshold = threshold.value(), "match run queued");
        let run = self.engine.find_matches(job);
        tokio::pin!(run);
        // The timeout covers the run itself, not time queued behind other sessions.
        let result = tokio::select! {
            biased;
            res = &mut run => Ok(res),
            () = progress.started() => tokio::time::timeout(self.settings.match_timeout, &mut run).await,
        };
        let outcome = match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                progress.finish();
                return Err(e.into());
            }
            Err(_) => {
                progress.cancel();
                let secs = self.settings.match_timeout.as_secs();
                tracing::warn!(session = session_id, timeout_secs = secs, "match run timed out; cancelling");
                return Err(ServiceError::MatchTimeout(secs));
            }
        };

        let run = {
            let mut sessions = self.sessions.lock().await;
            let slot = slot_mut(&mut sessions, session_id)?;
            slot.session.complete_run(plan, outcome.records.clone())?
        };

        let persisted = match run {
            Some(run) => Some(self.persist_run(session_id, &run).await),
            None => None,
        };

        Ok(RunSummary {
            session_id: session_id.to_string(),
            threshold,
            photos,
            matches: outcome.records,
            diagnostics: outcome.diagnostics,
            persisted,
        })
    }

    async fn persist_run(&self, session_id: &str, run: &MatchRun) -> bool {
        match self.store.insert_match_run(session_id, run).await {
            Ok(match_id) => {
                tracing::debug!(session = session_id, match_id, "match run stored");
                true
            }
            Err(e) => {
                tracing::warn!(session = session_id, error = %e, "failed to persist match run; results kept");
                false
            }
        }
    }

    /// Ask a running match to stop. Returns false if nothing was running.
    pub async fn cancel_match(&self, session_id: &str) -> bool {
        let sessions = self.sessions.lock().await;
        match sessions.get(session_id).and_then(|slot| slot.run.as_ref()) {
            Some(run) if run.is_running() => {
                run.cancel();
                tracing::info!(session = session_id, "match run cancellation requested");
                true
            }
            _ => false,
        }
    }

    /// Progress of the latest run, if the session has had one.
    pub async fn progress(&self, session_id: &str) -> Result<Option<ProgressSnapshot>, ServiceError> {
        let sessions = self.sessions.lock().await;
        let slot = sessions
            .get(session_id)
            .ok_or_else(|| ServiceError::SessionNotFound(session_id.to_string()))?;
        Ok(slot.run.as_ref().map(|r| r.snapshot()))
    }

    pub async fn results(&self, session_id: &str) -> Result<ResultsView, ServiceError> {
        let mut sessions = self.resident(session_id).await?;
        let slot = slot_mut(&mut sessions, session_id)?;
        Ok(ResultsView {
            session_id: session_id.to_string(),
            phase: slot.session.phase(),
            threshold: slot.session.results_threshold(),
            matches: slot.session.results().unwrap_or_default().to_vec(),
        })
    }

    /// Zip of the current matches, entries named `detected_<n>_<filename>`.
    pub async fn export_archive(&self, session_id: &str) -> Result<Vec<u8>, ServiceError> {
        let mut sessions = self.resident(session_id).await?;
        let slot = slot_mut(&mut sessions, session_id)?;
        let photos = slot.session.matched_photos();
        if photos.is_empty() {
            return Err(ServiceError::NoResults);
        }
        let bytes = archive_bytes(photos.iter().copied())?;
        tracing::info!(session = session_id, entries = photos.len(), bytes = bytes.len(), "archive exported");
        Ok(bytes)
    }

    pub async fn reset(&self, session_id: &str) -> Result<SessionInfo, ServiceError> {
        let mut sessions = self.resident(session_id).await?;
        let slot = slot_mut(&mut sessions, session_id)?;
        slot.session.reset();
        tracing::info!(session = session_id, "session reset");
        Ok(SessionInfo::of(&slot.session))
    }

    pub async fn history(&self, session_id: &str) -> Result<Vec<MatchRun>, ServiceError> {
        Ok(self.store.list_match_runs(session_id).await?)
    }

    /// Drop a session from memory and the store. Returns false if it was unknown to both.
    pub async fn delete_session(&self, session_id: &str) -> Result<bool, ServiceError> {
        let resident = {
            let mut sessions = self.sessions.lock().await;
            let slot = sessions.remove(session_id);
            if let Some(run) = slot.as_ref().and_then(|s| s.run.as_ref()) {
                run.cancel();
            }
            slot.is_some()
        };
        let stored = self.store.delete_session(session_id).await?;
        tracing::info!(session = session_id, resident, stored, "session deleted");
        Ok(resident || stored)
    }

    pub async fn status(&self) -> ServiceStatus {
        let (active_sessions, running_matches) = {
            let sessions = self.sessions.lock().await;
            (sessions.len(), sessions.values().filter(|s| s.is_running()).count())
        };
        ServiceStatus {
            version: env!("CARGO_PKG_VERSION"),
            active_sessions,
            running_matches,
            cached_photos: self.engine.cached_photos().await.ok(),
            threshold_range: self.settings.threshold_range,
            downscale_factor: self.settings.downscale_factor,
            match_timeout_secs: self.settings.match_timeout.as_secs(),
            camera: self.settings.camera.as_ref().map(|c| c.device.clone()),
        }
    }

    /// Lock the session map with `session_id` resident, restoring it from the store if needed.
    async fn resident(&self, session_id: &str) -> Result<MutexGuard<'_, Sessions>, ServiceError> {
        let mut sessions = self.sessions.lock().await;
        self.evict_idle(&mut sessions, session_id);
        match sessions.get_mut(session_id) {
            Some(slot) => slot.last_used = Instant::now(),
            None => {
                let session = self.restore(session_id).await?;
                sessions.insert(session_id.to_string(), SessionSlot::new(session));
            }
        }
        Ok(sessions)
    }

    /// Drop idle sessions other than `keep`. Their photos stay in the store.
    fn evict_idle(&self, sessions: &mut Sessions, keep: &str) {
        let now = Instant::now();
        let before = sessions.len();
        sessions.retain(|id, slot| id == keep || !slot.evictable(now, self.settings.session_idle));
        let evicted = before - sessions.len();
        if evicted > 0 {
            tracing::debug!(evicted, resident = sessions.len(), "evicted idle sessions");
        }
    }

    async fn restore(&self, session_id: &str) -> Result<Session, ServiceError> {
        let photos = self.store.list_photos(session_id).await?;
        if photos.is_empty() {
            tracing::warn!(session = session_id, "no stored photos for session; not resuming");
            return Err(ServiceError::SessionNotFound(session_id.to_string()));
        }

        let record = self.store.load_session(session_id).await?;
        let (created_at, threshold) = match record {
            Some(r) => (r.created_at, r.threshold),
            None => (Utc::now(), self.settings.threshold_range.default_threshold()),
        };
        tracing::info!(session = session_id, photos = photos.len(), "session resumed from store");
        Ok(Session::resume(session_id.to_string(), created_at, threshold, photos))
    }
}

fn slot_mut<'a>(sessions: &'a mut Sessions, session_id: &str) -> Result<&'a mut SessionSlot, ServiceError> {
    sessions
        .get_mut(session_id)
        .ok_or_else(|| ServiceError::SessionNotFound(session_id.to_string()))
}
