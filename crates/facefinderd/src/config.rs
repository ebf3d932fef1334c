use anyhow::{Context, Result};
use facefinder_core::{OnnxOracle, ThresholdRange};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration: optional TOML file, then `FACEFINDER_*` overrides.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory containing `det_10g.onnx` and `w600k_r50.onnx`.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// V4L2 device used for target snapshots.
    pub camera_device: String,
    /// Frames discarded before a snapshot while exposure settles.
    pub warmup_frames: usize,
    /// Frames read per snapshot; the brightest non-dark one wins.
    pub snapshot_attempts: usize,
    /// Candidate images are shrunk by this integer factor before detection.
    pub downscale_factor: u32,
    pub threshold_min: f64,
    pub threshold_max: f64,
    pub threshold_default: f64,
    /// A match run taking longer than this is cancelled.
    pub match_timeout_secs: u64,
    /// Photos whose embeddings are kept between runs.
    pub cache_capacity: usize,
    /// Resident sessions idle this long are dropped from memory.
    pub session_idle_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let range = OnnxOracle::THRESHOLD_RANGE;
        Self {
            model_dir: facefinder_core::default_model_dir(),
            db_path: facefinder_core::default_data_dir().join("face_finder.db"),
            camera_device: "/dev/video0".to_string(),
            warmup_frames: 4,
            snapshot_attempts: 5,
            downscale_factor: 1,
            threshold_min: range.min,
            threshold_max: range.max,
            threshold_default: range.default,
            match_timeout_secs: 600,
            cache_capacity: facefinder_core::matcher::DEFAULT_CACHE_CAPACITY,
            session_idle_secs: 1800,
        }
    }
}

impl Config {
    /// Load from the config file (if any) and the process environment.
    pub fn load() -> Result<Self> {
        let path = config_path();
        let mut config = Self::from_file(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Defaults when `path` does not exist.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading config at {}", path.display()))?;
        let config = toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
        tracing::info!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Apply `FACEFINDER_*` variables. Unparseable values are ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("FACEFINDER_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEFINDER_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEFINDER_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        override_parsed(&lookup, "FACEFINDER_WARMUP_FRAMES", &mut self.warmup_frames);
        override_parsed(&lookup, "FACEFINDER_DOWNSCALE", &mut self.downscale_factor);
        override_parsed(&lookup, "FACEFINDER_THRESHOLD_MIN", &mut self.threshold_min);
        override_parsed(&lookup, "FACEFINDER_THRESHOLD_MAX", &mut self.threshold_max);
        override_parsed(&lookup, "FACEFINDER_THRESHOLD_DEFAULT", &mut self.threshold_default);
        override_parsed(&lookup, "FACEFINDER_MATCH_TIMEOUT_SECS", &mut self.match_timeout_secs);
        override_parsed(&lookup, "FACEFINDER_CACHE_CAPACITY", &mut self.cache_capacity);
        override_parsed(&lookup, "FACEFINDER_SESSION_IDLE_SECS", &mut self.session_idle_secs);
    }

    pub fn validate(&self) -> Result<()> {
        self.threshold_range()?;
        anyhow::ensure!(self.downscale_factor >= 1, "downscale_factor must be at least 1");
        anyhow::ensure!(self.match_timeout_secs > 0, "match_timeout_secs must be positive");
        Ok(())
    }

    pub fn threshold_range(&self) -> Result<ThresholdRange> {
        ThresholdRange::new(self.threshold_min, self.threshold_max, self.threshold_default)
            .context("invalid threshold range")
    }

    pub fn match_timeout(&self) -> Duration {
        Duration::from_secs(self.match_timeout_secs)
    }

    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }
}

/// `FACEFINDER_CONFIG`, else `$XDG_CONFIG_HOME/facefinder/config.toml`.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("FACEFINDER_CONFIG") {
        return PathBuf::from(path);
    }
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        })
        .join("facefinder/config.toml")
}

fn override_parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable override"),
    }
}
