//! Stop signalling for the worker holding a task's execution lease.

use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

/// Why a worker was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Keep the partial output for a later resume.
    Pause,
    /// Remove the partial output.
    Cancel,
    /// Process is going down; keep partial output, leave the task for recovery.
    Shutdown,
}

impl StopReason {
    pub fn keeps_partial_output(&self) -> bool {
        !matches!(self, StopReason::Cancel)
    }
}

/// Cancellation token paired with the reason of the first stop request.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<StopReason>>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop. The first reason wins; returns false if a stop was
    /// already requested.
    pub fn stop(&self, reason: StopReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        self.token.cancel();
        first
    }

    pub fn reason(&self) -> Option<StopReason> {
        self.reason.get().copied()
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once a stop is requested.
    pub async fn stopped(&self) -> StopReason {
        self.token.cancelled().await;
        self.reason().unwrap_or(StopReason::Shutdown)
    }

    /// The underlying token, for code that only needs cancellation.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}
