use rollcall_core::{DetectorConfig, EncoderConfig, DEFAULT_MATCH_THRESHOLD};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Path of an optional TOML config file.
pub const CONFIG_PATH_VAR: &str = "ROLLCALL_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Engine configuration: defaults, then an optional TOML file, then
/// `ROLLCALL_*` environment overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cascade model (JSON or OpenCV XML); the built-in model when unset.
    pub cascade_path: Option<PathBuf>,
    /// Cosine similarity a match must exceed.
    pub match_threshold: f64,
    /// Pending requests the engine queue holds before callers wait.
    pub queue_depth: usize,
    pub detector: DetectorConfig,
    pub encoder: EncoderConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_data_dir().join("rollcall.db"),
            cascade_path: None,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            queue_depth: 4,
            detector: DetectorConfig::default(),
            encoder: EncoderConfig::default(),
        }
    }
}

impl Config {
    /// Load from `ROLLCALL_CONFIG` (if set) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_VAR) {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml(&raw)?;
        tracing::info!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply `ROLLCALL_*` overrides read through `var`.
    ///
    /// Unparseable values are logged and ignored.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = var("ROLLCALL_CASCADE_PATH") {
            self.cascade_path = Some(PathBuf::from(v));
        }
        if let Some(v) = parse_var(&var, "ROLLCALL_MATCH_THRESHOLD") {
            self.match_threshold = v;
        }
        if let Some(v) = parse_var(&var, "ROLLCALL_MIN_CONFIDENCE") {
            self.encoder.min_confidence = v;
        }
        if let Some(v) = parse_var::<u32>(&var, "ROLLCALL_MIN_FACE_SIZE") {
            self.detector.min_face_size = (v, v);
        }
        if let Some(v) = parse_var(&var, "ROLLCALL_MIN_NEIGHBORS") {
            self.detector.min_neighbors = v;
        }
        if let Some(v) = parse_var(&var, "ROLLCALL_QUEUE_DEPTH") {
            self.queue_depth = v;
        }
    }
}

fn parse_var<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = var(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}
