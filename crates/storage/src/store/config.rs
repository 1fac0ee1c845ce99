#![forbid(unsafe_code)]

use qc_core::policy::{
    DEFAULT_BASE_BACKOFF, DEFAULT_IDLE_TIMEOUT_S, DEFAULT_MAX_RETRIES, DEFAULT_POLL_INTERVAL_S,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "queue_config.json";

/// `queue_config.json`. Unknown keys are ignored; missing keys fall back to
/// the built-in defaults. Workers read this once at startup.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct QueueConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: i64,
    #[serde(default = "default_base_backoff")]
    pub base_backoff: f64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: f64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: f64,
    #[serde(default)]
    pub default_timeout_seconds: Option<f64>,
}

fn default_max_retries() -> i64 {
    DEFAULT_MAX_RETRIES
}

fn default_base_backoff() -> f64 {
    DEFAULT_BASE_BACKOFF
}

fn default_idle_timeout() -> f64 {
    DEFAULT_IDLE_TIMEOUT_S
}

fn default_poll_interval() -> f64 {
    DEFAULT_POLL_INTERVAL_S
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_backoff: DEFAULT_BASE_BACKOFF,
            idle_timeout: DEFAULT_IDLE_TIMEOUT_S,
            poll_interval: DEFAULT_POLL_INTERVAL_S,
            default_timeout_seconds: None,
        }
    }
}

impl QueueConfig {
    pub fn path(data_dir: &Path) -> PathBuf {
        data_dir.join(CONFIG_FILE_NAME)
    }

    /// Load the config, seeding the file with defaults when it is missing.
    /// An unreadable or unparseable file degrades to defaults rather than
    /// blocking queue operation.
    pub fn load(data_dir: &Path) -> Self {
        let path = Self::path(data_dir);
        if !path.exists() {
            let cfg = Self::default();
            let _ = cfg.save(data_dir);
            return cfg;
        }
        std::fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, data_dir: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(data_dir)?;
        let text = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(Self::path(data_dir), text)
    }
}
