//! Configuration loading and validation
//!
//! The watcher reads one TOML file. Its location is resolved in priority
//! order:
//! 1. Command-line argument (highest priority)
//! 2. `A360_CONFIG_PATH` environment variable
//! 3. Platform config dir (`<config>/a360/a360.toml`)
//! 4. `./a360.toml` (fallback)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

fn default_event_host() -> String {
    "127.0.0.1".to_string()
}

fn default_event_port() -> u16 {
    8765
}

fn default_timeline_code() -> String {
    "A".to_string()
}

fn default_timeline_folder_name() -> String {
    "TimelineA".to_string()
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_stability_cycles() -> u32 {
    2
}

fn default_source_model_tool() -> String {
    "ComfyUI".to_string()
}

fn default_true() -> bool {
    true
}

/// Watcher service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Root of the subjects dataset; subject base paths are relative to it
    pub project_root: PathBuf,
    /// Directory holding the registry sheet files
    pub registry_dir: PathBuf,
    /// Flat output directory written by the external generator
    pub watch_dir: PathBuf,

    /// Host the live event channel binds to
    #[serde(default = "default_event_host")]
    pub event_host: String,
    /// Port the live event channel binds to
    #[serde(default = "default_event_port")]
    pub event_port: u16,

    /// Timeline code recorded in registry rows
    #[serde(default = "default_timeline_code")]
    pub timeline_code: String,
    /// Folder under each subject directory holding canonical timeline images
    #[serde(default = "default_timeline_folder_name")]
    pub timeline_folder_name: String,

    /// Watch loop poll interval
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Consecutive unchanged observations before a file counts as complete
    #[serde(default = "default_stability_cycles")]
    pub stability_cycles: u32,

    /// Tool name recorded with generated image rows
    #[serde(default = "default_source_model_tool")]
    pub source_model_tool: String,

    /// SHA-256 stored files for provenance records
    #[serde(default = "default_true")]
    pub hash_images: bool,

    /// Append ML dataset-index records on every store
    #[serde(default = "default_true")]
    pub write_dataset_index: bool,
    #[serde(default)]
    pub dataset_index_path: Option<PathBuf>,

    /// Append every watcher event to a JSONL audit log
    #[serde(default = "default_true")]
    pub write_event_log: bool,
    #[serde(default)]
    pub event_log_path: Option<PathBuf>,
}

impl AppConfig {
    /// Resolve the config file location (see module docs for priority).
    pub fn resolve_path(cli_arg: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = cli_arg {
            return Ok(path.to_path_buf());
        }

        if let Ok(path) = std::env::var("A360_CONFIG_PATH") {
            return Ok(PathBuf::from(path));
        }

        if let Some(dir) = dirs::config_dir() {
            let candidate = dir.join("a360").join("a360.toml");
            if candidate.exists() {
                return Ok(candidate);
            }
        }

        let local = PathBuf::from("a360.toml");
        if local.exists() {
            return Ok(local);
        }

        Err(Error::Config(
            "could not find a360.toml; pass --config or set A360_CONFIG_PATH".to_string(),
        ))
    }

    /// Load and parse the config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {} failed: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("parse {} failed: {e}", path.display())))
    }

    /// Enforce fatal startup conditions.
    ///
    /// The watch directory and registry directory must already exist; the
    /// process refuses to run in a degraded silent state without them. A
    /// missing project root is only a warning since subject folders are
    /// created on demand.
    pub fn validate(&self) -> Result<()> {
        if !self.watch_dir.is_dir() {
            return Err(Error::Config(format!(
                "watch directory not found: {}",
                self.watch_dir.display()
            )));
        }
        if !self.registry_dir.is_dir() {
            return Err(Error::Config(format!(
                "registry directory not found: {}",
                self.registry_dir.display()
            )));
        }
        if self.stability_cycles < 2 {
            return Err(Error::Config(format!(
                "stability_cycles must be at least 2 (got {})",
                self.stability_cycles
            )));
        }
        if !self.project_root.exists() {
            warn!(
                "project root does not exist yet: {} (subject folders will be created as needed)",
                self.project_root.display()
            );
        }
        Ok(())
    }

    /// Event log location, defaulting under the project root.
    pub fn event_log_path(&self) -> PathBuf {
        self.event_log_path
            .clone()
            .unwrap_or_else(|| self.project_root.join("event_log.jsonl"))
    }

    /// Dataset index location, defaulting under the project root.
    pub fn dataset_index_path(&self) -> PathBuf {
        self.dataset_index_path
            .clone()
            .unwrap_or_else(|| self.project_root.join("dataset_index.jsonl"))
    }

    /// Canonical timeline directory for a subject base path.
    pub fn timeline_dir(&self, base_path: &str) -> PathBuf {
        let rel: PathBuf = base_path
            .replace('\\', "/")
            .trim_matches('/')
            .split('/')
            .collect();
        self.project_root.join(rel).join(&self.timeline_folder_name)
    }
}
