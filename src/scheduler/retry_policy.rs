//! Retry policy for failed tasks.
//!
//! Implements exponential backoff with jitter.

use crate::config::SchedulerSettings;
use crate::task::FailureKind;
use rand::Rng;
use std::time::Duration;

/// Retry policy implementing exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts a task may start before a recoverable failure becomes terminal.
    pub max_attempts: u32,
    /// Initial backoff duration in milliseconds.
    pub initial_backoff_ms: u64,
    /// Maximum backoff duration in milliseconds (cap for exponential growth).
    pub max_backoff_ms: u64,
    /// Multiplier applied to backoff after each retry.
    pub backoff_multiplier: f64,
    /// Maximum relative deviation added to each delay, e.g. 0.2 for ±20%.
    pub jitter_ratio: f64,
}

impl RetryPolicy {
    /// Create a new RetryPolicy from configuration settings.
    pub fn new(config: &SchedulerSettings) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_backoff_ms: config.initial_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
            backoff_multiplier: config.backoff_multiplier,
            jitter_ratio: config.jitter_ratio,
        }
    }

    /// Whether a failure of `kind` on attempt number `attempt_count` gets
    /// another attempt.
    pub fn should_retry(&self, kind: FailureKind, attempt_count: u32) -> bool {
        kind == FailureKind::Recoverable && attempt_count < self.max_attempts
    }

    /// Backoff without jitter for the given retry count:
    /// `initial_backoff * multiplier^retry_count`, capped at `max_backoff_ms`.
    pub fn backoff_ms(&self, retry_count: u32) -> u64 {
        let exponent = retry_count.min(i32::MAX as u32) as i32;
        let backoff = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        backoff.min(self.max_backoff_ms as f64) as u64
    }

    /// Backoff with jitter applied, still capped at `max_backoff_ms`.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let base = self.backoff_ms(retry_count) as f64;
        let jittered = if self.jitter_ratio > 0.0 && base > 0.0 {
            let factor = rand::rng().random_range(-self.jitter_ratio..=self.jitter_ratio);
            base * (1.0 + factor)
        } else {
            base
        };
        Duration::from_millis(jittered.clamp(0.0, self.max_backoff_ms as f64) as u64)
    }

    /// Delay before the next attempt. A source that asked us to wait longer
    /// than the backoff (`Retry-After`) gets its way, even past the cap.
    pub fn retry_delay(&self, retry_count: u32, retry_after: Option<Duration>) -> Duration {
        let backoff = self.backoff(retry_count);
        retry_after.map_or(backoff, |after| backoff.max(after))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&SchedulerSettings::default())
    }
}
