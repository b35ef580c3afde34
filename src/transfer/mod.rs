//! Transfer engine: streams one selected stream to local storage.

mod http;

pub use http::{HttpTransferEngine, HttpTransferSettings};

use crate::extractor::StreamDescriptor;
use crate::lease::{StopReason, StopSignal};
use crate::task::FailureKind;
use futures::stream::BoxStream;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const ENOSPC: i32 = 28;

/// What to transfer and where.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub task_id: String,
    pub source: StreamDescriptor,
    pub output_path: PathBuf,
    /// Bytes already on disk from an earlier attempt.
    pub resume_offset: u64,
}

/// Progress reported by a running transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferTick {
    /// Always the first tick. `offset` is where writing actually starts,
    /// which is 0 when the source ignored the requested range.
    Started {
        offset: u64,
        total: Option<u64>,
        /// The source serves byte ranges, so a partial file can be resumed.
        resumable: bool,
    },
    Progress {
        bytes_done: u64,
        bytes_total: Option<u64>,
    },
    /// Everything was written and flushed.
    Finished { bytes_done: u64 },
    /// The stop signal fired. Partial output was kept or removed according
    /// to `reason`.
    Stopped { reason: StopReason, bytes_done: u64 },
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Source answered HTTP {status}")]
    Http {
        status: u16,
        retry_after: Option<Duration>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
}

impl TransferError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TransferError::Network(_) | TransferError::SizeMismatch { .. } => {
                FailureKind::Recoverable
            }
            TransferError::Http { status, .. } => match status {
                408 | 429 => FailureKind::Recoverable,
                s if *s >= 500 => FailureKind::Recoverable,
                _ => FailureKind::Fatal,
            },
            TransferError::Io(e) => {
                if e.raw_os_error() == Some(ENOSPC)
                    || e.kind() == std::io::ErrorKind::PermissionDenied
                {
                    FailureKind::Fatal
                } else {
                    FailureKind::Recoverable
                }
            }
        }
    }

    /// Whether this failure came from the source throttling us.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, TransferError::Http { status: 429, .. })
    }
}

/// A finite, lazily driven sequence of ticks. Nothing happens until it is polled.
pub type TickStream = BoxStream<'static, Result<TransferTick, TransferError>>;

pub trait TransferEngine: Send + Sync {
    /// Start streaming `request.source` into `request.output_path`.
    ///
    /// The stream ends after `Finished`, `Stopped`, or the first error. When
    /// `stop` fires the engine must stop writing promptly and remove the
    /// partial file only for [`StopReason::Cancel`].
    fn transfer(&self, request: TransferRequest, stop: StopSignal) -> TickStream;
}
