use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facefinder_core::{
    CandidatePhoto, Diagnostic, MatchEngine, MatchObserver, MatchOptions, OnnxOracle,
};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[zbus::proxy(
    interface = "org.facefinder.FaceFinder1",
    default_service = "org.facefinder.FaceFinder1",
    default_path = "/org/facefinder/FaceFinder1"
)]
trait FaceFinder {
    async fn create_session(&self) -> zbus::Result<String>;
    async fn load_session(&self, session_id: &str) -> zbus::Result<String>;
    async fn list_sessions(&self, limit: u32) -> zbus::Result<String>;
    async fn upload_photos(&self, session_id: &str, photos: &[(String, Vec<u8>)], replace: bool)
        -> zbus::Result<String>;
    async fn set_threshold(&self, session_id: &str, threshold: f64) -> zbus::Result<String>;
    async fn capture_target(&self, session_id: &str, image: &[u8], label: &str) -> zbus::Result<String>;
    async fn capture_target_from_camera(&self, session_id: &str) -> zbus::Result<String>;
    async fn run_match(&self, session_id: &str) -> zbus::Result<String>;
    async fn cancel_match(&self, session_id: &str) -> zbus::Result<bool>;
    async fn progress(&self, session_id: &str) -> zbus::Result<String>;
    async fn results(&self, session_id: &str) -> zbus::Result<String>;
    async fn export_archive(&self, session_id: &str) -> zbus::Result<Vec<u8>>;
    async fn reset(&self, session_id: &str) -> zbus::Result<String>;
    async fn history(&self, session_id: &str) -> zbus::Result<String>;
    async fn delete_session(&self, session_id: &str) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "facefinder", about = "Find the photos a person appears in")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new session
    New,
    /// Resume a stored session
    Load {
        /// Session ID
        id: String,
    },
    /// List recent sessions
    Sessions {
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },
    /// Add photos to search
    Upload {
        #[arg(short, long)]
        session: String,
        /// Discard the session's current photos first
        #[arg(long)]
        replace: bool,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Set the match threshold (lower is stricter)
    Threshold {
        #[arg(short, long)]
        session: String,
        value: f64,
    },
    /// Capture the target face from an image file or the webcam
    Target {
        #[arg(short, long)]
        session: String,
        #[arg(required_unless_present = "camera", conflicts_with = "camera")]
        file: Option<PathBuf>,
        #[arg(long)]
        camera: bool,
    },
    /// Search the session's photos for the target face
    Match {
        #[arg(short, long)]
        session: String,
    },
    /// Show the current matches
    Results {
        #[arg(short, long)]
        session: String,
    },
    /// Write the matched photos to a zip archive
    Export {
        #[arg(short, long)]
        session: String,
        out: PathBuf,
    },
    /// Clear the target and results
    Reset {
        #[arg(short, long)]
        session: String,
    },
    /// Show past match runs
    History {
        #[arg(short, long)]
        session: String,
    },
    /// Delete a session with its photos and history
    Delete {
        #[arg(short, long)]
        session: String,
    },
    /// Cancel a running match
    Cancel {
        #[arg(short, long)]
        session: String,
    },
    /// Show daemon status
    Status,
    /// List video capture devices
    Cameras,
    /// Search photos without the daemon
    Scan {
        #[arg(short, long)]
        target: PathBuf,
        #[arg(required = true)]
        photos: Vec<PathBuf>,
        #[arg(long, default_value_t = OnnxOracle::THRESHOLD_RANGE.default)]
        threshold: f64,
        #[arg(long, default_value_t = 1)]
        downscale: u32,
        /// Directory containing det_10g.onnx and w600k_r50.onnx
        #[arg(long)]
        model_dir: Option<PathBuf>,
        /// Also write the matches to this zip archive
        #[arg(long)]
        export: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Cameras => {
            let devices = facefinder_hw::Camera::list_devices();
            if devices.is_empty() {
                println!("No video capture devices found");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
            Ok(())
        }
        Commands::Scan {
            target,
            photos,
            threshold,
            downscale,
            model_dir,
            export,
        } => scan(&target, &photos, threshold, downscale, model_dir, export.as_deref()),
        command => {
            let conn = zbus::Connection::session()
                .await
                .context("connecting to the session bus")?;
            let proxy = FaceFinderProxy::new(&conn).await?;
            remote(&proxy, command).await
        }
    }
}

async fn remote(proxy: &FaceFinderProxy<'_>, command: Commands) -> Result<()> {
    match command {
        Commands::New => {
            let info: Value = serde_json::from_str(&proxy.create_session().await?)?;
            println!("{}", info["session_id"].as_str().unwrap_or_default());
        }
        Commands::Load { id } => print_json(&proxy.load_session(&id).await?)?,
        Commands::Sessions { limit } => {
            let sessions: Value = serde_json::from_str(&proxy.list_sessions(limit).await?)?;
            for s in sessions.as_array().into_iter().flatten() {
                println!(
                    "{}  {}  threshold={}  photos={}",
                    s["session_id"].as_str().unwrap_or_default(),
                    s["created_at"].as_str().unwrap_or_default(),
                    s["threshold"],
                    s["photo_count"],
                );
            }
        }
        Commands::Upload { session, replace, files } => {
            // One call per file keeps each message well under the bus size limit.
            let mut reply = String::new();
            for (i, path) in files.iter().enumerate() {
                let photo = read_photo(path)?;
                reply = proxy
                    .upload_photos(&session, &[photo], replace && i == 0)
                    .await
                    .with_context(|| format!("uploading {}", path.display()))?;
            }
            let summary: Value = serde_json::from_str(&reply)?;
            println!(
                "Uploaded {} photo(s); session has {}",
                files.len(),
                summary["session"]["photo_count"]
            );
            if summary["persisted"] == Value::Bool(false) {
                eprintln!("warning: photos were not saved to the database");
            }
        }
        Commands::Threshold { session, value } => print_json(&proxy.set_threshold(&session, value).await?)?,
        Commands::Target { session, file, camera } => {
            let reply = if camera {
                proxy.capture_target_from_camera(&session).await?
            } else if let Some(path) = file {
                let bytes = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
                let label = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
                proxy.capture_target(&session, &bytes, &label).await?
            } else {
                bail!("give a target image or --camera");
            };
            print_json(&reply)?;
        }
        Commands::Match { session } => run_match(proxy, &session).await?,
        Commands::Results { session } => {
            let view: Value = serde_json::from_str(&proxy.results(&session).await?)?;
            print_matches(&view["matches"]);
        }
        Commands::Export { session, out } => {
            let bytes = proxy.export_archive(&session).await?;
            std::fs::write(&out, &bytes).with_context(|| format!("writing {}", out.display()))?;
            println!("Wrote {} ({} bytes)", out.display(), bytes.len());
        }
        Commands::Reset { session } => print_json(&proxy.reset(&session).await?)?,
        Commands::History { session } => print_json(&proxy.history(&session).await?)?,
        Commands::Delete { session } => {
            if proxy.delete_session(&session).await? {
                println!("Deleted {session}");
            } else {
                println!("No such session: {session}");
            }
        }
        Commands::Cancel { session } => {
            if proxy.cancel_match(&session).await? {
                println!("Cancellation requested");
            } else {
                println!("No match run in progress");
            }
        }
        Commands::Status => print_json(&proxy.status().await?)?,
        Commands::Cameras | Commands::Scan { .. } => bail!("not a daemon command"),
    }
    Ok(())
}

/// Run a match, printing progress until it finishes. Ctrl-C cancels the run.
async fn run_match(proxy: &FaceFinderProxy<'_>, session: &str) -> Result<()> {
    let run = proxy.run_match(session);
    tokio::pin!(run);
    let mut ticker = tokio::time::interval(Duration::from_millis(500));

    let reply = loop {
        tokio::select! {
            result = &mut run => break result?,
            _ = ticker.tick() => {
                if let Ok(raw) = proxy.progress(session).await {
                    let p: Value = serde_json::from_str(&raw).unwrap_or(Value::Null);
                    if !p.is_null() {
                        eprint!("\rScanning {}/{}", p["done"], p["total"]);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\nCancelling...");
                proxy.cancel_match(session).await?;
            }
        }
    };
    eprintln!();

    let summary: Value = serde_json::from_str(&reply)?;
    for d in summary["diagnostics"].as_array().into_iter().flatten() {
        eprintln!(
            "warning: {} ({})",
            d["filename"].as_str().unwrap_or_default(),
            d["kind"].as_str().unwrap_or_default()
        );
    }
    print_matches(&summary["matches"]);
    if summary["persisted"] == Value::Bool(false) {
        eprintln!("warning: this run was not saved to history");
    }
    Ok(())
}

fn print_matches(matches: &Value) {
    let list: Vec<&Value> = matches.as_array().into_iter().flatten().collect();
    if list.is_empty() {
        println!("No matches");
        return;
    }
    println!("Found {} photo(s):", list.len());
    for m in list {
        let distance = m["distance"].as_f64().unwrap_or(f64::NAN);
        println!(
            "  {:<40} distance={:.4} confidence={}%",
            m["filename"].as_str().unwrap_or_default(),
            distance,
            m["confidence"]
        );
    }
}

fn print_json(raw: &str) -> Result<()> {
    let value: Value = serde_json::from_str(raw)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn read_photo(path: &Path) -> Result<(String, Vec<u8>)> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Ok((name, bytes))
}

struct ConsoleObserver;

impl MatchObserver for ConsoleObserver {
    fn progress(&mut self, done: usize, total: usize) {
        eprint!("\rScanning {done}/{total}");
    }

    fn diagnostic(&mut self, diagnostic: Diagnostic) {
        eprintln!("\rwarning: {diagnostic}");
    }
}

fn scan(
    target: &Path,
    photos: &[PathBuf],
    threshold: f64,
    downscale: u32,
    model_dir: Option<PathBuf>,
    export: Option<&Path>,
) -> Result<()> {
    let threshold = OnnxOracle::THRESHOLD_RANGE.check(threshold)?;
    let model_dir = model_dir.unwrap_or_else(facefinder_core::default_model_dir);
    let oracle = OnnxOracle::load(&model_dir).with_context(|| format!("loading models from {}", model_dir.display()))?;
    let mut engine = MatchEngine::new(oracle);

    let target_bytes = std::fs::read(target).with_context(|| format!("reading {}", target.display()))?;
    let Some(embedding) = engine.extract_primary_embedding(&target_bytes)? else {
        bail!("no face detected in {}", target.display());
    };

    let candidates = photos
        .iter()
        .map(|p| read_photo(p).map(|(name, bytes)| CandidatePhoto::new(&name, bytes)))
        .collect::<Result<Vec<_>>>()?;

    let options = MatchOptions::new(threshold).with_downscale(downscale);
    let matches = engine.find_matches(&embedding, &candidates, &options, &mut ConsoleObserver)?;
    eprintln!();

    println!("Found {} of {} photo(s):", matches.len(), candidates.len());
    for m in &matches {
        println!(
            "  {:<40} distance={:.4} confidence={}%",
            m.filename,
            m.display_distance(),
            m.confidence
        );
    }

    if let Some(out) = export {
        let file = std::fs::File::create(out).with_context(|| format!("creating {}", out.display()))?;
        let entries = facefinder_core::write_archive(file, matches.iter().map(|m| &candidates[m.index]))?;
        println!("Wrote {entries} photo(s) to {}", out.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use facefinder_core::ThresholdError;

    #[test]
    fn test_scan_threshold_defaults_to_model_range() {
        let cli = Cli::try_parse_from(["facefinder", "scan", "-t", "me.jpg", "a.jpg"]).unwrap();
        let Commands::Scan { threshold, .. } = cli.command else {
            panic!("expected scan");
        };
        assert_eq!(threshold, OnnxOracle::THRESHOLD_RANGE.default);
    }

    #[test]
    fn test_scan_checks_threshold_against_model_range() {
        let photos = [PathBuf::from("a.jpg")];
        let models = Some(PathBuf::from("/nonexistent/facefinder-models"));

        let err = scan(Path::new("me.jpg"), &photos, 0.5, 1, models.clone(), None).unwrap_err();
        assert!(matches!(err.downcast_ref::<ThresholdError>(), Some(ThresholdError::OutOfRange { .. })));

        // In range: fails later, on the missing models.
        let err = scan(Path::new("me.jpg"), &photos, 1.0, 1, models, None).unwrap_err();
        assert!(err.downcast_ref::<ThresholdError>().is_none());
    }
}
