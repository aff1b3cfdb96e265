//! Configuration loading and data folder resolution

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Worker configuration loaded from TOML
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Root folder for blob storage (chunk files, index files)
    pub data_dir: PathBuf,
    /// SQLite database path (queue, jobs, operation summaries)
    pub database_path: PathBuf,
    /// Folder for consumer pid files
    pub pid_dir: PathBuf,
    /// Prefix applied to logical queue names when no transport
    /// override is configured (e.g. "bulkq." -> "bulkq.default")
    pub queue_prefix: String,
    /// Logical name of the default destination
    pub default_queue: String,
    /// Queue this consumer pulls from (logical name)
    pub consumer_queue: String,
    /// Poll interval when the queue is empty (milliseconds)
    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            database_path: data_dir.join("bulkq.db"),
            pid_dir: data_dir.join("pids"),
            data_dir,
            queue_prefix: "bulkq.".to_string(),
            default_queue: "default".to_string(),
            consumer_queue: "default".to_string(),
            poll_interval_ms: 200,
        }
    }
}

impl WorkerConfig {
    /// Load configuration following the priority order:
    /// 1. Explicit path argument (highest priority)
    /// 2. `BULKQ_CONFIG` environment variable
    /// 3. Platform config directory (`<config>/bulkq/config.toml`)
    /// 4. Compiled defaults (fallback)
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::from_file(path);
        }

        if let Ok(path) = std::env::var("BULKQ_CONFIG") {
            return Self::from_file(Path::new(&path));
        }

        if let Some(path) = default_config_file() {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Ok(Self::default())
    }

    /// Parse a TOML configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Cannot read {}: {}", path.display(), e)))?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Cannot parse {}: {}", path.display(), e)))
    }
}

/// Default configuration file path for the platform
fn default_config_file() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("bulkq").join("config.toml"))
}

/// OS-dependent default data folder
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("bulkq"))
        .unwrap_or_else(|| PathBuf::from("./bulkq_data"))
}
