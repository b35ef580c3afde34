use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub output_dir: Option<String>,
    pub ffmpeg_path: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub retention_days: Option<u64>,
    pub prune_interval_hours: Option<u64>,

    pub scheduler: Option<SchedulerConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_concurrent: Option<usize>,
    /// Per-platform concurrency ceilings, e.g. `youtube = 1`.
    pub platform_limits: Option<HashMap<String, usize>>,
    /// Per-platform admissions per minute.
    pub platform_starts_per_minute: Option<HashMap<String, u32>>,
    pub max_attempts: Option<u32>,
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub jitter_ratio: Option<f64>,
    pub extract_timeout_secs: Option<u64>,
    pub stall_window_secs: Option<u64>,
    pub tick_interval_ms: Option<u64>,
    pub default_quality: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
