mod file_config;

pub use file_config::{FileConfig, SchedulerConfig};

use crate::task::Quality;
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_MAX_CONCURRENT: &str = "MAX_CONCURRENT_DOWNLOADS";
pub const ENV_DOWNLOADS_PATH: &str = "DOWNLOADS_PATH";
pub const ENV_DATABASE_DIR: &str = "DATABASE_DIR";

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub max_concurrent: Option<usize>,
    pub ffmpeg_path: Option<String>,
    pub request_timeout_secs: u64,
    pub retention_days: u64,
    pub prune_interval_hours: u64,
}

impl CliConfig {
    /// Applies environment overrides on top of the CLI values.
    ///
    /// `lookup` is usually `|k| std::env::var(k).ok()`.
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(value) = lookup(ENV_MAX_CONCURRENT) {
            let parsed = value
                .trim()
                .parse::<usize>()
                .with_context(|| format!("Invalid {}: {:?}", ENV_MAX_CONCURRENT, value))?;
            self.max_concurrent = Some(parsed);
        }
        if let Some(value) = lookup(ENV_DOWNLOADS_PATH) {
            self.output_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup(ENV_DATABASE_DIR) {
            self.db_dir = Some(PathBuf::from(value));
        }
        Ok(self)
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Core settings
    pub db_dir: PathBuf,
    pub ffmpeg_path: String,
    pub request_timeout_secs: u64,
    pub retention_days: u64,
    pub prune_interval_hours: u64,

    pub scheduler: SchedulerSettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        // TOML overrides CLI for each field
        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "db_dir must be specified via --db-dir, {} or in config file",
                    ENV_DATABASE_DIR
                )
            })?;

        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let defaults = SchedulerSettings::default();
        let output_dir = file
            .output_dir
            .map(PathBuf::from)
            .or_else(|| cli.output_dir.clone())
            .unwrap_or(defaults.default_output_dir);

        let ffmpeg_path = file
            .ffmpeg_path
            .or_else(|| cli.ffmpeg_path.clone())
            .unwrap_or_else(|| "ffmpeg".to_string());
        let request_timeout_secs = file
            .request_timeout_secs
            .unwrap_or(cli.request_timeout_secs);
        let retention_days = file.retention_days.unwrap_or(cli.retention_days);
        let prune_interval_hours = file
            .prune_interval_hours
            .unwrap_or(cli.prune_interval_hours);

        // Scheduler settings - merge file config with defaults
        let sc = file.scheduler.unwrap_or_default();
        let default_quality = match sc.default_quality {
            Some(label) => label
                .parse::<Quality>()
                .map_err(|e| anyhow::anyhow!("Invalid default_quality: {}", e))?,
            None => defaults.default_quality,
        };
        let scheduler = SchedulerSettings {
            max_concurrent: sc
                .max_concurrent
                .or(cli.max_concurrent)
                .unwrap_or(defaults.max_concurrent),
            platform_limits: sc.platform_limits.unwrap_or_default(),
            platform_starts_per_minute: sc.platform_starts_per_minute.unwrap_or_default(),
            max_attempts: sc.max_attempts.unwrap_or(defaults.max_attempts),
            initial_backoff_ms: sc.initial_backoff_ms.unwrap_or(defaults.initial_backoff_ms),
            max_backoff_ms: sc.max_backoff_ms.unwrap_or(defaults.max_backoff_ms),
            backoff_multiplier: sc.backoff_multiplier.unwrap_or(defaults.backoff_multiplier),
            jitter_ratio: sc.jitter_ratio.unwrap_or(defaults.jitter_ratio),
            extract_timeout: sc
                .extract_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.extract_timeout),
            stall_window: sc
                .stall_window_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.stall_window),
            tick_interval: sc
                .tick_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.tick_interval),
            default_output_dir: output_dir,
            default_quality,
        };
        scheduler.validate()?;

        Ok(Self {
            db_dir,
            ffmpeg_path,
            request_timeout_secs,
            retention_days,
            prune_interval_hours,
            scheduler,
        })
    }

    pub fn tasks_db_path(&self) -> PathBuf {
        self.db_dir.join("mediaq.db")
    }
}

/// Everything the scheduler needs at construction. Passed explicitly so that
/// several schedulers in one process never share limits.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Global ceiling on concurrently active tasks.
    pub max_concurrent: usize,
    /// Per-platform ceilings. Platforms not listed are only bound by `max_concurrent`.
    pub platform_limits: HashMap<String, usize>,
    /// Per-platform admissions allowed in any one-minute window.
    pub platform_starts_per_minute: HashMap<String, u32>,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// Jitter applied to each backoff, as a fraction of the delay.
    pub jitter_ratio: f64,
    pub extract_timeout: Duration,
    /// A transfer with no tick for this long is treated as a recoverable failure.
    pub stall_window: Duration,
    /// Admission loop period when nothing else wakes it.
    pub tick_interval: Duration,
    pub default_output_dir: PathBuf,
    pub default_quality: Quality,
}

impl SchedulerSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            bail!("max_concurrent must be at least 1");
        }
        if self.max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }
        if let Some((platform, _)) = self.platform_limits.iter().find(|(_, l)| **l == 0) {
            bail!("platform limit for '{}' must be at least 1", platform);
        }
        if let Some((platform, _)) = self
            .platform_starts_per_minute
            .iter()
            .find(|(_, l)| **l == 0)
        {
            bail!("starts per minute for '{}' must be at least 1", platform);
        }
        if self.backoff_multiplier < 1.0 {
            bail!("backoff_multiplier must be >= 1.0");
        }
        if !(0.0..1.0).contains(&self.jitter_ratio) {
            bail!("jitter_ratio must be in [0, 1)");
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            bail!("initial_backoff_ms must not exceed max_backoff_ms");
        }
        Ok(())
    }

    pub fn platform_limit(&self, platform: &str) -> Option<usize> {
        self.platform_limits.get(platform).copied()
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            platform_limits: HashMap::new(),
            platform_starts_per_minute: HashMap::new(),
            max_attempts: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter_ratio: 0.2,
            extract_timeout: Duration::from_secs(30),
            stall_window: Duration::from_secs(60),
            tick_interval: Duration::from_millis(1000),
            default_output_dir: PathBuf::from("downloads"),
            default_quality: Quality::Best,
        }
    }
}
