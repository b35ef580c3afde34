//! mediaq: a resumable media download queue.
//!
//! This library exposes the internal modules for the binary and for testing.

pub mod config;
pub mod converter;
pub mod extractor;
pub mod lease;
pub mod progress;
pub mod scheduler;
pub mod sqlite_persistence;
pub mod task;
pub mod task_store;
pub mod transfer;

// Re-export commonly used types for convenience
pub use scheduler::{Scheduler, SchedulerError, SchedulerResult};
pub use task::{Task, TaskOptions, TaskState};
pub use task_store::{SqliteTaskStore, TaskStore};
