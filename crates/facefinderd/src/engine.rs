use facefinder_core::{
    CandidatePhoto, Diagnostic, Embedding, EmbeddingOracle, MatchEngine, MatchError, MatchObserver, MatchOptions,
    MatchRecord,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Notify};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error("failed to start engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Live counters of one match run, shared between the engine thread and
/// whoever polls or cancels it.
#[derive(Debug, Default)]
pub struct RunProgress {
    done: AtomicUsize,
    total: AtomicUsize,
    cancelled: AtomicBool,
    finished: AtomicBool,
    started: AtomicBool,
    start_signal: Notify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub done: usize,
    pub total: usize,
    pub running: bool,
    pub cancelled: bool,
}

impl RunProgress {
    pub fn new(total: usize) -> Self {
        let progress = Self::default();
        progress.total.store(total, Ordering::Relaxed);
        progress
    }

    /// Called by the engine thread when it picks the run up.
    pub fn start(&self) {
        self.started.store(true, Ordering::Relaxed);
        self.start_signal.notify_one();
    }

    /// Resolves once the engine thread has started the run.
    pub async fn started(&self) {
        if self.started.load(Ordering::Relaxed) {
            return;
        }
        self.start_signal.notified().await;
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn finish(&self) {
        self.finished.store(true, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        !self.finished.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            done: self.done.load(Ordering::Relaxed),
            total: self.total.load(Ordering::Relaxed),
            running: self.is_running(),
            cancelled: self.is_cancelled(),
        }
    }
}

/// Everything the engine needs for one `find_matches` call.
pub struct MatchJob {
    pub target: Embedding,
    pub photos: Vec<CandidatePhoto>,
    pub options: MatchOptions,
    pub progress: Arc<RunProgress>,
}

/// Matches plus the per-photo diagnostics collected along the way.
#[derive(Debug)]
pub struct MatchOutcome {
    pub records: Vec<MatchRecord>,
    pub diagnostics: Vec<Diagnostic>,
}

struct JobObserver<'a> {
    progress: &'a RunProgress,
    diagnostics: Vec<Diagnostic>,
}

impl MatchObserver for JobObserver<'_> {
    fn progress(&mut self, done: usize, total: usize) {
        self.progress.done.store(done, Ordering::Relaxed);
        self.progress.total.store(total, Ordering::Relaxed);
    }

    fn diagnostic(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    fn should_stop(&self) -> bool {
        self.progress.is_cancelled()
    }
}

/// Messages sent from service handlers to the engine thread.
enum EngineRequest {
    ExtractTarget {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Option<Embedding>, EngineError>>,
    },
    FindMatches {
        job: MatchJob,
        reply: oneshot::Sender<Result<MatchOutcome, EngineError>>,
    },
    CachedPhotos {
        reply: oneshot::Sender<usize>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Embedding of the most confident face in `image`, or `None` if there is no face.
    pub async fn extract_target(&self, image: Vec<u8>) -> Result<Option<Embedding>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::ExtractTarget { image, reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn find_matches(&self, job: MatchJob) -> Result<MatchOutcome, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::FindMatches { job, reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn cached_photos(&self) -> Result<usize, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::CachedPhotos { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the oracle and the face cache; requests are served one
/// at a time in arrival order.
pub fn spawn_engine<O>(oracle: O, cache_capacity: usize) -> Result<EngineHandle, EngineError>
where
    O: EmbeddingOracle + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);
    let mut engine = MatchEngine::with_cache_capacity(oracle, cache_capacity);

    std::thread::Builder::new()
        .name("facefinder-engine".into())
        .spawn(move || {
            tracing::info!(cache_capacity, "engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::ExtractTarget { image, reply } => {
                        let result = engine.extract_primary_embedding(&image).map_err(EngineError::from);
                        let _ = reply.send(result);
                    }
                    EngineRequest::FindMatches { job, reply } => {
                        let result = run_job(&mut engine, job);
                        let _ = reply.send(result);
                    }
                    EngineRequest::CachedPhotos { reply } => {
                        let _ = reply.send(engine.cached_photos());
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}

fn run_job<O: EmbeddingOracle>(engine: &mut MatchEngine<O>, job: MatchJob) -> Result<MatchOutcome, EngineError> {
    let mut observer = JobObserver {
        progress: &job.progress,
        diagnostics: Vec::new(),
    };
    job.progress.start();
    let started = std::time::Instant::now();
    let result = engine.find_matches(&job.target, &job.photos, &job.options, &mut observer);
    job.progress.finish();

    let records = result?;
    tracing::info!(
        photos = job.photos.len(),
        matches = records.len(),
        diagnostics = observer.diagnostics.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "match run finished"
    );
    Ok(MatchOutcome {
        records,
        diagnostics: observer.diagnostics,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use facefinder_core::{FaceBox, MatchThreshold, OracleError};
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use std::time::Duration;

    /// Oracle keyed on image width: each known width maps to a list of face embeddings.
    #[derive(Default)]
    pub(crate) struct WidthOracle {
        faces: Vec<(u32, Vec<Embedding>)>,
        delay: Option<Duration>,
    }

    impl WidthOracle {
        pub fn with_faces(mut self, width: u32, faces: Vec<Vec<f32>>) -> Self {
            self.faces.push((width, faces.into_iter().map(Embedding::new).collect()));
            self
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        fn lookup(&self, image: &DynamicImage) -> &[Embedding] {
            self.faces
                .iter()
                .find(|(w, _)| *w == image.width())
                .map(|(_, f)| f.as_slice())
                .unwrap_or(&[])
        }
    }

    impl EmbeddingOracle for WidthOracle {
        fn locate_faces(&mut self, image: &DynamicImage) -> Result<Vec<FaceBox>, OracleError> {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            Ok(self
                .lookup(image)
                .iter()
                .map(|_| FaceBox {
                    x: 0.0,
                    y: 0.0,
                    width: 1.0,
                    height: 1.0,
                    confidence: 0.9,
                    landmarks: None,
                })
                .collect())
        }

        fn embed_faces(&mut self, image: &DynamicImage, faces: &[FaceBox]) -> Result<Vec<Embedding>, OracleError> {
            Ok(self.lookup(image).iter().take(faces.len()).cloned().collect())
        }
    }

    pub(crate) fn png(width: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, 4, Rgb([120, 90, 60])))
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    fn job(photos: Vec<CandidatePhoto>, threshold: f64) -> MatchJob {
        MatchJob {
            target: Embedding::new(vec![0.0, 0.0]),
            progress: Arc::new(RunProgress::new(photos.len())),
            photos,
            options: MatchOptions::new(MatchThreshold::new(threshold).unwrap()),
        }
    }

    #[tokio::test]
    async fn test_extract_target() {
        let engine = spawn_engine(WidthOracle::default().with_faces(10, vec![vec![1.0, 0.0]]), 8).unwrap();
        let embedding = engine.extract_target(png(10)).await.unwrap().unwrap();
        assert_eq!(embedding.values, vec![1.0, 0.0]);
        assert!(engine.extract_target(png(11)).await.unwrap().is_none());
        assert!(matches!(
            engine.extract_target(vec![1, 2, 3]).await,
            Err(EngineError::Match(MatchError::UnreadableImage(_)))
        ));
    }

    #[tokio::test]
    async fn test_find_matches_reports_progress_and_diagnostics() {
        let oracle = WidthOracle::default()
            .with_faces(10, vec![vec![0.2, 0.0]])
            .with_faces(20, vec![vec![0.0, 0.6]]);
        let engine = spawn_engine(oracle, 8).unwrap();

        let photos = vec![
            CandidatePhoto::new("a.png", png(10)),
            CandidatePhoto::new("b.png", png(20)),
            CandidatePhoto::new("c.png", png(30)),
            CandidatePhoto::new("broken.jpg", vec![0xFF, 0xD8]),
        ];
        let job = job(photos, 0.45);
        let progress = job.progress.clone();
        let outcome = engine.find_matches(job).await.unwrap();

        let names: Vec<&str> = outcome.records.iter().map(|r| r.filename.as_str()).collect();
        assert_eq!(names, vec!["a.png"]);
        assert_eq!(outcome.diagnostics.len(), 2);
        assert!(matches!(outcome.diagnostics[0], Diagnostic::NoFaceDetected { index: 2, .. }));
        assert!(matches!(outcome.diagnostics[1], Diagnostic::UnreadableImage { index: 3, .. }));

        let snap = progress.snapshot();
        assert_eq!((snap.done, snap.total, snap.running), (4, 4, false));
        assert_eq!(engine.cached_photos().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_job() {
        let engine = spawn_engine(WidthOracle::default(), 8).unwrap();
        let job = job(vec![CandidatePhoto::new("a.png", png(10))], 0.5);
        job.progress.cancel();
        let progress = job.progress.clone();
        let result = engine.find_matches(job).await;
        assert!(matches!(result, Err(EngineError::Match(MatchError::Cancelled { done: 0, total: 1 }))));
        assert!(!progress.is_running());
    }

    #[tokio::test]
    async fn test_queued_job_starts_after_previous_run() {
        let engine = spawn_engine(WidthOracle::default().with_delay(Duration::from_millis(100)), 8).unwrap();
        let first = job(vec![CandidatePhoto::new("a.png", png(10))], 0.5);
        let second = job(vec![CandidatePhoto::new("b.png", png(20))], 0.5);
        let second_progress = second.progress.clone();

        let first_run = engine.find_matches(first);
        let second_run = engine.find_matches(second);
        let observe = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let queued = tokio::time::timeout(Duration::from_millis(10), second_progress.started()).await;
            assert!(queued.is_err());
            second_progress.started().await;
        };
        let (a, b, ()) = tokio::join!(first_run, second_run, observe);
        a.unwrap();
        b.unwrap();
    }
}
