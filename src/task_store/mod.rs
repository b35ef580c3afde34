//! Durable task storage.
//!
//! The store is the single source of truth for task state. Every state
//! change goes through [`TaskStore::update`], which refuses to write when the
//! caller's view of the state is stale.

mod schema;
mod sqlite_task_store;

pub use schema::TASKS_VERSIONED_SCHEMAS;
pub use sqlite_task_store::SqliteTaskStore;

use crate::task::{Pagination, QueueStats, Task, TaskFilter, TaskState};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Task {0} not found")]
    NotFound(String),

    #[error("Task {0} already exists")]
    AlreadyExists(String),

    /// The stored state differs from the one the caller based its write on.
    #[error("Task {id} is {actual}, expected {expected}")]
    Conflict {
        id: String,
        expected: TaskState,
        actual: TaskState,
    },

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Storage operations for download tasks.
pub trait TaskStore: Send + Sync {
    /// Insert a new task. Fails with `AlreadyExists` on a duplicate id.
    fn create(&self, task: &Task) -> StoreResult<()>;

    /// Atomically overwrite the full record of `task`.
    ///
    /// Fails with `Conflict` if the stored state is not `expected_state`, and
    /// with `NotFound` if the task does not exist.
    fn update(&self, task: &Task, expected_state: TaskState) -> StoreResult<()>;

    fn get(&self, id: &str) -> StoreResult<Option<Task>>;

    /// List tasks in queue order: priority, then submission time, then id.
    fn list(&self, filter: &TaskFilter, page: Pagination) -> StoreResult<Vec<Task>>;

    /// Delete a task record. Returns false if it did not exist.
    fn delete(&self, id: &str) -> StoreResult<bool>;

    /// Tasks admission may start at `now` (ms), in queue order.
    fn list_admission_candidates(&self, now: i64) -> StoreResult<Vec<Task>>;

    /// Every task that is not terminal.
    fn list_non_terminal(&self) -> StoreResult<Vec<Task>>;

    /// Move every `Active` task back to `Pending` in one transaction.
    /// The interrupted attempt is not charged: `attempt_count` drops by one
    /// so that re-admission counts the same attempt again.
    /// Returns the ids that were reset.
    fn reset_active_to_pending(&self) -> StoreResult<Vec<String>>;

    /// Earliest scheduled retry among failed tasks, if any.
    fn next_retry_at(&self) -> StoreResult<Option<i64>>;

    fn stats(&self) -> StoreResult<QueueStats>;

    /// Delete terminal tasks completed before `cutoff` (ms). Returns the count.
    fn delete_terminal_before(&self, cutoff: i64) -> StoreResult<usize>;
}
