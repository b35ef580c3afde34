//! Scheduler harness wired to the fakes
//!
//! Each test gets its own store, output directory and fakes. The admission
//! loop only runs after `start()`; tests that want to drive admission by hand
//! call `scheduler.tick()` instead.

use super::constants::*;
use super::fakes::{FakeConverter, FakeExtractor, FakeTransferEngine, TransferMode};
use mediaq::config::SchedulerSettings;
use mediaq::progress::{BroadcastProgressSink, TaskEvent};
use mediaq::scheduler::Scheduler;
use mediaq::task::{Pagination, Task, TaskFilter, TaskState};
use mediaq::task_store::{SqliteTaskStore, TaskStore};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Settings tuned for fast tests: short ticks, tiny backoff, no jitter.
pub fn fast_settings(output_dir: &Path) -> SchedulerSettings {
    SchedulerSettings {
        max_concurrent: 3,
        max_attempts: 3,
        initial_backoff_ms: 20,
        max_backoff_ms: 100,
        backoff_multiplier: 2.0,
        jitter_ratio: 0.0,
        extract_timeout: Duration::from_secs(2),
        stall_window: Duration::from_secs(2),
        tick_interval: Duration::from_millis(20),
        default_output_dir: output_dir.to_path_buf(),
        ..Default::default()
    }
}

pub struct TestScheduler {
    pub scheduler: Scheduler,
    pub store: Arc<SqliteTaskStore>,
    pub extractor: Arc<FakeExtractor>,
    pub transfer: Arc<FakeTransferEngine>,
    pub converter: Arc<FakeConverter>,
    pub sink: BroadcastProgressSink,
    shutdown: CancellationToken,
    run_handle: Mutex<Option<JoinHandle<()>>>,
    output_dir: PathBuf,
    _temp_dir: Option<TempDir>,
}

impl TestScheduler {
    /// In-memory store, default fast settings.
    pub fn new(mode: TransferMode) -> Self {
        Self::configured(mode, |_| {})
    }

    /// In-memory store, fast settings adjusted by `configure`.
    pub fn configured(mode: TransferMode, configure: impl FnOnce(&mut SchedulerSettings)) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = SqliteTaskStore::in_memory().expect("Failed to open in-memory store");
        let mut settings = fast_settings(temp_dir.path());
        configure(&mut settings);
        Self::build(store, settings, mode, Some(temp_dir))
    }

    /// Store backed by the database file at `db_path`, writing into `output_dir`.
    pub fn open(db_path: &Path, output_dir: &Path, mode: TransferMode) -> Self {
        Self::open_configured(db_path, output_dir, mode, |_| {})
    }

    /// Like [`TestScheduler::open`], with fast settings adjusted by `configure`.
    pub fn open_configured(
        db_path: &Path,
        output_dir: &Path,
        mode: TransferMode,
        configure: impl FnOnce(&mut SchedulerSettings),
    ) -> Self {
        let store = SqliteTaskStore::new(db_path).expect("Failed to open task store");
        let mut settings = fast_settings(output_dir);
        configure(&mut settings);
        Self::build(store, settings, mode, None)
    }

    fn build(
        store: SqliteTaskStore,
        settings: SchedulerSettings,
        mode: TransferMode,
        temp_dir: Option<TempDir>,
    ) -> Self {
        let store = Arc::new(store);
        let extractor = Arc::new(FakeExtractor::default());
        let transfer = Arc::new(FakeTransferEngine::new(mode));
        let converter = Arc::new(FakeConverter::default());
        let sink = BroadcastProgressSink::default();
        let output_dir = settings.default_output_dir.clone();

        let scheduler = Scheduler::new(
            store.clone(),
            extractor.clone(),
            transfer.clone(),
            converter.clone(),
            Arc::new(sink.clone()),
            settings,
        );

        Self {
            scheduler,
            store,
            extractor,
            transfer,
            converter,
            sink,
            shutdown: CancellationToken::new(),
            run_handle: Mutex::new(None),
            output_dir,
            _temp_dir: temp_dir,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn events(&self) -> broadcast::Receiver<TaskEvent> {
        self.sink.subscribe()
    }

    /// Start the admission loop in the background.
    pub fn start(&self) {
        let scheduler = self.scheduler.clone();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move { scheduler.run(shutdown).await });
        *self.run_handle.lock().unwrap() = Some(handle);
    }

    /// Stop the admission loop and wait for its workers to let go.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.run_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.await.expect("Scheduler loop panicked");
        }
    }

    pub fn task(&self, id: &str) -> Task {
        self.store
            .get(id)
            .expect("Failed to read task")
            .expect("Task not found")
    }

    /// Poll until `predicate` holds for task `id`.
    pub async fn wait_until(&self, id: &str, what: &str, predicate: impl Fn(&Task) -> bool) -> Task {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            let task = self.task(id);
            if predicate(&task) {
                return task;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "Timed out waiting for task {} to be {} (state {}, bytes {:?}/{:?}, error {:?})",
                    id, what, task.state, task.bytes_done, task.bytes_total, task.last_error
                );
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    pub async fn wait_for_state(&self, id: &str, state: TaskState) -> Task {
        self.wait_until(id, &state.to_string(), |task| task.state == state)
            .await
    }

    /// Poll until no worker holds a lease.
    pub async fn wait_for_idle(&self) {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        while self.scheduler.active_count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "Timed out waiting for {} workers to finish",
                    self.scheduler.active_count()
                );
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Count tasks per state straight from the store.
    pub fn count_in_state(&self, state: TaskState) -> usize {
        self.store
            .list(&TaskFilter::state(state), Pagination { limit: 1000, offset: 0 })
            .expect("Failed to list tasks")
            .len()
    }
}

impl Drop for TestScheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
