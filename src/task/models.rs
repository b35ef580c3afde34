//! Data models for download tasks.
//!
//! A [`Task`] is a plain record; everything that acts on it lives in the
//! scheduler and the store.

use super::TaskState;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Output formats the conversion step accepts.
pub const SUPPORTED_FORMATS: &[&str] = &[
    "mp4", "webm", "mkv", "avi", "mov", "flv", "mp3", "aac", "ogg", "wav", "flac", "m4a",
];

/// Audio-only formats among [`SUPPORTED_FORMATS`].
pub const AUDIO_FORMATS: &[&str] = &["mp3", "aac", "ogg", "wav", "flac", "m4a"];

const VIDEO_HEIGHTS: &[u32] = &[2160, 1440, 1080, 720, 480, 360, 240, 144];

lazy_static! {
    static ref HEIGHT_LABEL: Regex = Regex::new(r"(?i)^\s*(\d{3,4})p").unwrap();
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Requested stream quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Quality {
    #[default]
    Best,
    Worst,
    /// Maximum video height, e.g. `720` for `720p`.
    Height(u32),
    AudioOnly,
}

impl Quality {
    /// Extracts the pixel height from a label like `720p` or `1080p60`.
    pub fn height_from_label(label: &str) -> Option<u32> {
        HEIGHT_LABEL
            .captures(label)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }
}

impl FromStr for Quality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "best" => return Ok(Quality::Best),
            "worst" => return Ok(Quality::Worst),
            "audio_only" | "audio" => return Ok(Quality::AudioOnly),
            _ => {}
        }
        match normalized
            .strip_suffix('p')
            .and_then(|h| h.parse::<u32>().ok())
        {
            Some(height) if VIDEO_HEIGHTS.contains(&height) => Ok(Quality::Height(height)),
            _ => Err(format!("unknown quality '{}'", s)),
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quality::Best => f.write_str("best"),
            Quality::Worst => f.write_str("worst"),
            Quality::Height(h) => write!(f, "{}p", h),
            Quality::AudioOnly => f.write_str("audio_only"),
        }
    }
}

impl From<Quality> for String {
    fn from(q: Quality) -> Self {
        q.to_string()
    }
}

impl TryFrom<String> for Quality {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Admission priority. Lower values are admitted first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    High = 1,
    #[default]
    Normal = 2,
    Low = 3,
}

impl TaskPriority {
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(TaskPriority::High),
            2 => Some(TaskPriority::Normal),
            3 => Some(TaskPriority::Low),
            _ => None,
        }
    }
}

impl FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(TaskPriority::High),
            "normal" => Ok(TaskPriority::Normal),
            "low" => Ok(TaskPriority::Low),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// Options supplied at submission. Immutable once the task is admitted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskOptions {
    pub quality: Quality,
    /// Container/audio format to convert to after the transfer, if any.
    pub target_format: Option<String>,
    /// Directory the output is written to. Falls back to the configured default.
    pub output_dir: Option<String>,
    /// File name without extension. Falls back to the media title.
    pub filename: Option<String>,
    pub priority: TaskPriority,
}

impl TaskOptions {
    pub fn with_quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.target_format = Some(format.into());
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<String>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// Checks the options for malformed values, returning a human readable reason.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(format) = &self.target_format {
            let format = format.to_ascii_lowercase();
            if !SUPPORTED_FORMATS.contains(&format.as_str()) {
                return Err(format!("unsupported target format '{}'", format));
            }
        }
        if let Some(filename) = &self.filename {
            if filename.trim().is_empty() {
                return Err("filename must not be empty".to_string());
            }
            if filename.contains('/') || filename.contains('\\') || filename == ".." {
                return Err(format!("filename '{}' must not contain a path", filename));
            }
        }
        if let Some(dir) = &self.output_dir {
            if dir.trim().is_empty() {
                return Err("output_dir must not be empty".to_string());
            }
        }
        Ok(())
    }
}

/// Classification of a task execution failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Eligible for an automatic retry.
    Recoverable,
    /// Never retried.
    Fatal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Recoverable => "recoverable",
            FailureKind::Fatal => "fatal",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "recoverable" => Some(FailureKind::Recoverable),
            "fatal" => Some(FailureKind::Fatal),
            _ => None,
        }
    }
}

/// Last failure recorded on a task, as shown to users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    pub kind: FailureKind,
    pub message: String,
}

/// A single user-requested download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Time-ordered UUID, never reused.
    pub id: String,
    pub source_url: String,
    /// Platform tag assigned at submission (e.g. "youtube", "generic").
    pub platform: String,
    pub options: TaskOptions,
    pub state: TaskState,
    /// Fraction in [0, 1].
    pub progress: f64,
    pub bytes_total: Option<u64>,
    pub bytes_done: Option<u64>,
    /// Execution attempts started so far. Resuming a pause does not count.
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub last_error: Option<LastError>,
    /// When a `Failed` task becomes eligible for its next attempt (ms).
    /// `None` on a `Failed` task means the failure is terminal.
    pub retry_at: Option<i64>,
    /// A `Paused` task the user asked to resume; admission picks it up.
    pub resume_requested: bool,
    pub title: Option<String>,
    pub duration_secs: Option<u64>,
    /// Destination of the raw transfer, stable once chosen.
    pub output_path: Option<String>,
    /// Verified output, the converted file when conversion ran.
    pub final_path: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl Task {
    /// Creates a new pending task.
    pub fn new(
        source_url: impl Into<String>,
        platform: impl Into<String>,
        options: TaskOptions,
        max_attempts: u32,
    ) -> Self {
        let now = now_millis();
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            source_url: source_url.into(),
            platform: platform.into(),
            options,
            state: TaskState::Pending,
            progress: 0.0,
            bytes_total: None,
            bytes_done: None,
            attempt_count: 0,
            max_attempts,
            last_error: None,
            retry_at: None,
            resume_requested: false,
            title: None,
            duration_secs: None,
            output_path: None,
            final_path: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Completed, Cancelled, or Failed with no retry scheduled.
    pub fn is_terminal(&self) -> bool {
        match self.state {
            TaskState::Completed | TaskState::Cancelled => true,
            TaskState::Failed => self.retry_at.is_none(),
            _ => false,
        }
    }

    /// Whether this task may move to `next` given its whole record.
    pub fn allows(&self, next: TaskState) -> bool {
        !self.is_terminal() && self.state.has_edge_to(next)
    }

    /// Whether admission may start this task at `now` (ms).
    pub fn is_admission_candidate(&self, now: i64) -> bool {
        match self.state {
            TaskState::Pending => true,
            TaskState::Paused => self.resume_requested,
            TaskState::Failed => self.retry_at.is_some_and(|at| at <= now),
            _ => false,
        }
    }

    /// Records byte progress, keeping `bytes_done <= bytes_total` and
    /// `progress` non-decreasing.
    pub fn record_bytes(&mut self, bytes_done: u64, bytes_total: Option<u64>) {
        let total = bytes_total.or(self.bytes_total);
        let done = match total {
            Some(total) => bytes_done.min(total),
            None => bytes_done,
        };
        self.bytes_total = total;
        self.bytes_done = Some(done);
        if let Some(total) = total.filter(|t| *t > 0) {
            let fraction = (done as f64 / total as f64).clamp(0.0, 1.0);
            if fraction > self.progress {
                self.progress = fraction;
            }
        }
    }
}

/// Filter for listing tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub state: Option<TaskState>,
    pub platform: Option<String>,
}

impl TaskFilter {
    pub fn state(state: TaskState) -> Self {
        Self {
            state: Some(state),
            platform: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub limit: usize,
    pub offset: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

/// Task counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub active: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total: usize,
}
