use crate::task::TaskState;
use crate::task_store::StoreError;
use thiserror::Error;

/// Errors returned synchronously by scheduler operations.
///
/// Task execution failures never surface here; they end up in the task's
/// `last_error`.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Task {0} not found")]
    NotFound(String),

    #[error("Cannot {action} task {id} while it is {from}")]
    InvalidTransition {
        id: String,
        from: TaskState,
        action: &'static str,
    },

    /// The task changed underneath the request; re-read and decide again.
    #[error("Task {id} changed concurrently (now {actual})")]
    Conflict { id: String, actual: TaskState },

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for SchedulerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => SchedulerError::NotFound(id),
            StoreError::Conflict { id, actual, .. } => SchedulerError::Conflict { id, actual },
            other => SchedulerError::Store(other),
        }
    }
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
