//! Per-platform admission throttling.
//!
//! Limits how many tasks of one platform may start per minute, and holds a
//! platform back entirely while it is cooling down after a rate-limit signal.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const WINDOW: Duration = Duration::from_secs(60);

/// Trait for admission throttling.
#[async_trait]
pub trait AdmissionThrottler: Send + Sync {
    /// How many more tasks of `platform` may start right now.
    /// `None` means unthrottled.
    async fn remaining_starts(&self, platform: &str) -> Option<u32>;

    /// Record that a task of `platform` was admitted.
    async fn record_start(&self, platform: &str);

    /// Block admissions for `platform` for `duration`. An existing longer
    /// cooldown is kept.
    async fn cool_down(&self, platform: &str, duration: Duration);

    /// Reset state (for testing or manual override).
    async fn reset(&self);
}

#[derive(Debug, Default)]
struct PlatformWindow {
    starts: VecDeque<Instant>,
    cooldown_until: Option<Instant>,
}

impl PlatformWindow {
    /// Drop starts older than the window.
    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.starts.front() {
            if now.duration_since(*front) >= WINDOW {
                self.starts.pop_front();
            } else {
                break;
            }
        }
    }

    fn cooling_down(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }
}

/// Sliding window throttler keyed by platform tag.
pub struct SlidingWindowThrottler {
    windows: Mutex<HashMap<String, PlatformWindow>>,
    /// Starts allowed per minute. Platforms not listed are unlimited.
    starts_per_minute: HashMap<String, u32>,
}

impl SlidingWindowThrottler {
    pub fn new(starts_per_minute: HashMap<String, u32>) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            starts_per_minute,
        }
    }
}

#[async_trait]
impl AdmissionThrottler for SlidingWindowThrottler {
    async fn remaining_starts(&self, platform: &str) -> Option<u32> {
        let mut windows = self.windows.lock().await;
        let now = Instant::now();
        let limit = self.starts_per_minute.get(platform).copied();

        let Some(window) = windows.get_mut(platform) else {
            return limit;
        };
        if window.cooling_down(now) {
            return Some(0);
        }
        window.cooldown_until = None;

        let limit = limit?;
        window.prune(now);
        Some(limit.saturating_sub(window.starts.len() as u32))
    }

    async fn record_start(&self, platform: &str) {
        if !self.starts_per_minute.contains_key(platform) {
            return;
        }
        let mut windows = self.windows.lock().await;
        let now = Instant::now();
        let window = windows.entry(platform.to_string()).or_default();
        window.prune(now);
        window.starts.push_back(now);
    }

    async fn cool_down(&self, platform: &str, duration: Duration) {
        let mut windows = self.windows.lock().await;
        let until = Instant::now() + duration;
        let window = windows.entry(platform.to_string()).or_default();
        if window.cooldown_until.map_or(true, |current| current < until) {
            window.cooldown_until = Some(until);
        }
    }

    async fn reset(&self) {
        let mut windows = self.windows.lock().await;
        windows.clear();
    }
}
