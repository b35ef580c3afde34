//! The scheduler: public task operations, admission and lease bookkeeping.

use super::admission::{self, AdmissionSlots};
use super::error::{SchedulerError, SchedulerResult};
use super::retry_policy::RetryPolicy;
use super::throttle::{AdmissionThrottler, SlidingWindowThrottler};
use super::worker;
use crate::config::SchedulerSettings;
use crate::converter::MediaConverter;
use crate::extractor::ExtractorGateway;
use crate::lease::{StopReason, StopSignal};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::task::{now_millis, Pagination, QueueStats, Task, TaskFilter, TaskOptions, TaskState};
use crate::task_store::{StoreError, TaskStore};
use crate::transfer::TransferEngine;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

/// Times a control operation re-reads the task after losing a race.
const MAX_CONFLICT_RETRIES: usize = 3;

/// How long shutdown waits for workers to let go of their leases.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Execution lease held by one running worker.
struct Lease {
    platform: String,
    stop: StopSignal,
}

/// State shared between the scheduler handle and its workers.
pub(super) struct SchedulerInner {
    pub(super) store: Arc<dyn TaskStore>,
    pub(super) extractor: Arc<dyn ExtractorGateway>,
    pub(super) transfer: Arc<dyn TransferEngine>,
    pub(super) converter: Arc<dyn MediaConverter>,
    pub(super) sink: Arc<dyn ProgressSink>,
    pub(super) settings: SchedulerSettings,
    pub(super) retry_policy: RetryPolicy,
    pub(super) throttler: Box<dyn AdmissionThrottler>,
    leases: Mutex<HashMap<String, Lease>>,
    /// Wakes the admission loop.
    wake: Notify,
    /// Signalled whenever a lease is released.
    released: Notify,
    /// Serializes admission passes.
    admission: tokio::sync::Mutex<()>,
}

impl SchedulerInner {
    pub(super) fn notify_state(&self, task_id: &str, old: TaskState, new: TaskState) {
        self.sink
            .notify(task_id, ProgressEvent::StateChanged { old, new });
    }

    pub(super) fn notify_progress(&self, task: &Task) {
        if let Some(bytes_done) = task.bytes_done {
            self.sink.notify(
                &task.id,
                ProgressEvent::ProgressTick {
                    bytes_done,
                    bytes_total: task.bytes_total,
                },
            );
        }
    }

    /// Drop the lease on `task_id` and let admission refill the slot.
    pub(super) fn release(&self, task_id: &str) {
        self.leases.lock().unwrap().remove(task_id);
        self.wake.notify_one();
        self.released.notify_one();
    }

    /// Signal the worker holding `task_id`, if any. Returns whether a lease
    /// was held.
    fn stop_lease(&self, task_id: &str, reason: StopReason) -> bool {
        match self.leases.lock().unwrap().get(task_id) {
            Some(lease) => {
                lease.stop.stop(reason);
                true
            }
            None => false,
        }
    }
}

/// Admits submitted tasks into a bounded pool of workers and exposes the
/// task control operations.
///
/// Cloning is cheap; clones share the same workers and leases.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        extractor: Arc<dyn ExtractorGateway>,
        transfer: Arc<dyn TransferEngine>,
        converter: Arc<dyn MediaConverter>,
        sink: Arc<dyn ProgressSink>,
        settings: SchedulerSettings,
    ) -> Self {
        let retry_policy = RetryPolicy::new(&settings);
        let throttler = Box::new(SlidingWindowThrottler::new(
            settings.platform_starts_per_minute.clone(),
        ));

        Self {
            inner: Arc::new(SchedulerInner {
                store,
                extractor,
                transfer,
                converter,
                sink,
                settings,
                retry_policy,
                throttler,
                leases: Mutex::new(HashMap::new()),
                wake: Notify::new(),
                released: Notify::new(),
                admission: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.inner.settings
    }

    /// Number of tasks currently holding an execution lease in this process.
    pub fn active_count(&self) -> usize {
        self.inner.leases.lock().unwrap().len()
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Create a pending task for `url`. Never touches the network.
    pub fn submit(&self, url: &str, options: TaskOptions) -> SchedulerResult<String> {
        let task = self.prepare(url, options)?;
        self.inner.store.create(&task)?;
        info!(
            "Submitted task {} ({}) for {}",
            task.id, task.platform, task.source_url
        );
        self.inner.wake.notify_one();
        Ok(task.id)
    }

    /// Submit several URLs with the same options. Every URL is validated
    /// before anything is stored.
    pub fn submit_batch<I, S>(&self, urls: I, options: TaskOptions) -> SchedulerResult<Vec<String>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tasks = urls
            .into_iter()
            .map(|url| self.prepare(url.as_ref(), options.clone()))
            .collect::<SchedulerResult<Vec<_>>>()?;
        if tasks.is_empty() {
            return Err(SchedulerError::InvalidInput("no URLs given".to_string()));
        }

        let mut ids = Vec::with_capacity(tasks.len());
        for task in &tasks {
            self.inner.store.create(task)?;
            ids.push(task.id.clone());
        }
        info!("Submitted batch of {} tasks", ids.len());
        self.inner.wake.notify_one();
        Ok(ids)
    }

    fn prepare(&self, url: &str, options: TaskOptions) -> SchedulerResult<Task> {
        let url = url.trim();
        if url.is_empty() {
            return Err(SchedulerError::InvalidInput(
                "url must not be empty".to_string(),
            ));
        }
        let parsed = Url::parse(url)
            .map_err(|e| SchedulerError::InvalidInput(format!("invalid url '{}': {}", url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(SchedulerError::InvalidInput(format!(
                "unsupported url scheme '{}'",
                parsed.scheme()
            )));
        }
        options.validate().map_err(SchedulerError::InvalidInput)?;

        let platform = self.inner.extractor.classify(&parsed);
        Ok(Task::new(
            url,
            platform,
            options,
            self.inner.settings.max_attempts,
        ))
    }

    // =========================================================================
    // Control
    // =========================================================================

    /// Pause an active task. Pausing a paused task is a no-op that also drops
    /// a pending resume request.
    pub fn pause(&self, task_id: &str) -> SchedulerResult<()> {
        self.retry_on_conflict(|| self.try_pause(task_id))
    }

    fn try_pause(&self, task_id: &str) -> SchedulerResult<()> {
        let mut task = self.get_task(task_id)?;
        match task.state {
            TaskState::Paused => {
                if task.resume_requested {
                    task.resume_requested = false;
                    task.updated_at = now_millis();
                    self.inner.store.update(&task, TaskState::Paused)?;
                    debug!("Task {} paused again before resuming", task_id);
                }
                Ok(())
            }
            TaskState::Active => {
                task.state = TaskState::Paused;
                task.updated_at = now_millis();
                self.inner.store.update(&task, TaskState::Active)?;
                self.inner.stop_lease(task_id, StopReason::Pause);
                self.inner
                    .notify_state(task_id, TaskState::Active, TaskState::Paused);
                info!("Paused task {}", task_id);
                Ok(())
            }
            from => Err(invalid_transition(task_id, from, "pause")),
        }
    }

    /// Ask for a paused task to run again. The task stays `Paused` until
    /// admission finds a free slot for it.
    pub fn resume(&self, task_id: &str) -> SchedulerResult<()> {
        self.retry_on_conflict(|| self.try_resume(task_id))
    }

    fn try_resume(&self, task_id: &str) -> SchedulerResult<()> {
        let mut task = self.get_task(task_id)?;
        match task.state {
            TaskState::Paused => {
                if !task.resume_requested {
                    task.resume_requested = true;
                    task.updated_at = now_millis();
                    self.inner.store.update(&task, TaskState::Paused)?;
                    info!("Resume requested for task {}", task_id);
                    self.inner.wake.notify_one();
                }
                Ok(())
            }
            from => Err(invalid_transition(task_id, from, "resume")),
        }
    }

    /// Cancel a task that has not finished. Partial output is removed.
    /// Cancelling a cancelled task is a no-op.
    pub async fn cancel(&self, task_id: &str) -> SchedulerResult<()> {
        let Some((task, leased)) = self.retry_on_conflict(|| self.try_cancel(task_id))? else {
            return Ok(());
        };
        // A running worker cleans up after itself.
        if !leased {
            worker::remove_outputs(&task).await;
        }
        Ok(())
    }

    fn try_cancel(&self, task_id: &str) -> SchedulerResult<Option<(Task, bool)>> {
        let mut task = self.get_task(task_id)?;
        if task.state == TaskState::Cancelled {
            return Ok(None);
        }
        if !task.allows(TaskState::Cancelled) {
            return Err(invalid_transition(task_id, task.state, "cancel"));
        }

        let from = task.state;
        let now = now_millis();
        task.state = TaskState::Cancelled;
        task.retry_at = None;
        task.resume_requested = false;
        task.completed_at = Some(now);
        task.updated_at = now;
        self.inner.store.update(&task, from)?;

        let leased = self.inner.stop_lease(task_id, StopReason::Cancel);
        self.inner
            .notify_state(task_id, from, TaskState::Cancelled);
        info!("Cancelled task {} (was {})", task_id, from);
        self.inner.wake.notify_one();
        Ok(Some((task, leased)))
    }

    fn retry_on_conflict<T>(
        &self,
        mut op: impl FnMut() -> SchedulerResult<T>,
    ) -> SchedulerResult<T> {
        let mut attempt = 1;
        loop {
            match op() {
                Err(SchedulerError::Conflict { id, actual }) if attempt < MAX_CONFLICT_RETRIES => {
                    debug!("Task {} changed to {} concurrently, re-reading", id, actual);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    // =========================================================================
    // Queries and housekeeping
    // =========================================================================

    pub fn status(&self, task_id: &str) -> SchedulerResult<Task> {
        self.get_task(task_id)
    }

    pub fn list(&self, filter: &TaskFilter, page: Pagination) -> SchedulerResult<Vec<Task>> {
        Ok(self.inner.store.list(filter, page)?)
    }

    pub fn stats(&self) -> SchedulerResult<QueueStats> {
        Ok(self.inner.store.stats()?)
    }

    /// 1-based position among the tasks waiting for admission, or `None` if
    /// the task is not waiting.
    pub fn queue_position(&self, task_id: &str) -> SchedulerResult<Option<usize>> {
        self.get_task(task_id)?;
        let candidates = self.inner.store.list_admission_candidates(now_millis())?;
        Ok(candidates
            .iter()
            .position(|t| t.id == task_id)
            .map(|index| index + 1))
    }

    /// Remove a finished task's record. Output files are left alone.
    pub fn delete(&self, task_id: &str) -> SchedulerResult<()> {
        let task = self.get_task(task_id)?;
        if !task.is_terminal() {
            return Err(invalid_transition(task_id, task.state, "delete"));
        }
        self.inner.store.delete(task_id)?;
        info!("Deleted task {}", task_id);
        Ok(())
    }

    /// Delete terminal tasks that finished more than `older_than` ago.
    pub fn prune_terminal(&self, older_than: Duration) -> SchedulerResult<usize> {
        let cutoff = now_millis() - older_than.as_millis() as i64;
        let deleted = self.inner.store.delete_terminal_before(cutoff)?;
        if deleted > 0 {
            info!("Pruned {} finished tasks", deleted);
        }
        Ok(deleted)
    }

    fn get_task(&self, task_id: &str) -> SchedulerResult<Task> {
        self.inner
            .store
            .get(task_id)?
            .ok_or_else(|| SchedulerError::NotFound(task_id.to_string()))
    }

    // =========================================================================
    // Recovery and admission
    // =========================================================================

    /// Re-queue tasks that were active when the process last stopped.
    ///
    /// Call once at startup, before [`Scheduler::run`]; the reset tasks are
    /// admitted by the next admission pass. Returns the re-queued ids.
    pub fn recover(&self) -> SchedulerResult<Vec<String>> {
        let non_terminal = self.inner.store.list_non_terminal()?;
        info!(
            "Recovering scheduler state: {} unfinished tasks in store",
            non_terminal.len()
        );

        let reset = self.inner.store.reset_active_to_pending()?;
        for task_id in &reset {
            warn!("Task {} was active at shutdown, re-queued", task_id);
            self.inner
                .notify_state(task_id, TaskState::Active, TaskState::Pending);
        }
        self.inner.wake.notify_one();
        Ok(reset)
    }

    /// Run one admission pass: stop workers whose task changed in the store,
    /// then start every candidate that fits. Returns how many tasks started.
    pub async fn tick(&self) -> SchedulerResult<usize> {
        let _guard = self.inner.admission.lock().await;
        self.reconcile_leases()?;
        self.admit().await
    }

    /// Stop workers whose task was changed by someone else, e.g. the CLI.
    fn reconcile_leases(&self) -> SchedulerResult<()> {
        let leased: Vec<(String, StopSignal)> = self
            .inner
            .leases
            .lock()
            .unwrap()
            .iter()
            .map(|(id, lease)| (id.clone(), lease.stop.clone()))
            .collect();

        for (task_id, stop) in leased {
            if stop.is_stopped() {
                continue;
            }
            let reason = match self.inner.store.get(&task_id)? {
                Some(task) => match task.state {
                    TaskState::Active => continue,
                    TaskState::Paused => StopReason::Pause,
                    TaskState::Cancelled => StopReason::Cancel,
                    _ => StopReason::Shutdown,
                },
                None => StopReason::Cancel,
            };
            info!(
                "Task {} changed outside this scheduler, stopping its worker ({:?})",
                task_id, reason
            );
            stop.stop(reason);
        }
        Ok(())
    }

    async fn admit(&self) -> SchedulerResult<usize> {
        let held: HashMap<String, String> = self
            .inner
            .leases
            .lock()
            .unwrap()
            .iter()
            .map(|(id, lease)| (id.clone(), lease.platform.clone()))
            .collect();

        let candidates: Vec<Task> = self
            .inner
            .store
            .list_admission_candidates(now_millis())?
            .into_iter()
            .filter(|task| !held.contains_key(&task.id))
            .collect();
        if candidates.is_empty() {
            return Ok(0);
        }

        let active: Vec<&str> = held.values().map(String::as_str).collect();
        let mut slots = AdmissionSlots::new(&self.inner.settings, &active);
        if slots.is_full() {
            return Ok(0);
        }
        let platforms: HashSet<&str> = candidates.iter().map(|t| t.platform.as_str()).collect();
        for platform in platforms {
            if let Some(budget) = self.inner.throttler.remaining_starts(platform).await {
                slots = slots.with_start_budget(platform, budget);
            }
        }

        let selected: Vec<Task> = admission::select(&candidates, &mut slots)
            .into_iter()
            .cloned()
            .collect();
        let mut started = 0;
        for task in selected {
            if self.start(task).await? {
                started += 1;
            }
        }
        Ok(started)
    }

    /// Move `task` to `Active` and hand it to a worker. Returns false if the
    /// task changed since it was read.
    async fn start(&self, mut task: Task) -> SchedulerResult<bool> {
        let from = task.state;
        let now = now_millis();
        if from == TaskState::Paused {
            task.resume_requested = false;
        } else {
            task.attempt_count += 1;
        }
        task.state = TaskState::Active;
        task.retry_at = None;
        task.started_at.get_or_insert(now);
        task.updated_at = now;

        let stop = StopSignal::new();
        self.inner.leases.lock().unwrap().insert(
            task.id.clone(),
            Lease {
                platform: task.platform.clone(),
                stop: stop.clone(),
            },
        );
        if let Err(e) = self.inner.store.update(&task, from) {
            self.inner.leases.lock().unwrap().remove(&task.id);
            if matches!(e, StoreError::Conflict { .. } | StoreError::NotFound(_)) {
                debug!("Task {} changed before admission: {}", task.id, e);
                return Ok(false);
            }
            return Err(e.into());
        }

        self.inner.throttler.record_start(&task.platform).await;
        self.inner
            .notify_state(&task.id, from, TaskState::Active);
        info!(
            "Admitted task {} ({}, attempt {}/{})",
            task.id, task.platform, task.attempt_count, task.max_attempts
        );
        tokio::spawn(worker::run(self.inner.clone(), task, stop));
        Ok(true)
    }

    /// The admission loop. Runs until `shutdown` fires, then stops every
    /// running worker with [`StopReason::Shutdown`] so that [`Scheduler::recover`]
    /// picks their tasks up on the next start.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            "Scheduler starting (max_concurrent={}, platform_limits={:?})",
            self.inner.settings.max_concurrent, self.inner.settings.platform_limits
        );

        loop {
            if let Err(e) = self.tick().await {
                error!("Admission pass failed: {}", e);
            }
            let delay = self.next_wake_delay();
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Scheduler shutting down");
                    break;
                }
                _ = self.inner.wake.notified() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.stop_workers().await;
        info!("Scheduler stopped");
    }

    /// Sleep until the next periodic tick or the next retry due time,
    /// whichever comes first.
    fn next_wake_delay(&self) -> Duration {
        let interval = self.inner.settings.tick_interval;
        match self.inner.store.next_retry_at() {
            Ok(Some(at)) => {
                let wait = at - now_millis();
                if wait > 0 {
                    interval.min(Duration::from_millis(wait as u64))
                } else {
                    interval
                }
            }
            Ok(None) => interval,
            Err(e) => {
                warn!("Failed to read next retry time: {}", e);
                interval
            }
        }
    }

    async fn stop_workers(&self) {
        let stops: Vec<StopSignal> = self
            .inner
            .leases
            .lock()
            .unwrap()
            .values()
            .map(|lease| lease.stop.clone())
            .collect();
        if stops.is_empty() {
            return;
        }

        info!("Stopping {} running tasks", stops.len());
        for stop in &stops {
            stop.stop(StopReason::Shutdown);
        }
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while self.active_count() > 0 {
            let released = tokio::time::timeout_at(deadline, self.inner.released.notified());
            if released.await.is_err() {
                warn!(
                    "{} tasks did not stop within {:?}",
                    self.active_count(),
                    SHUTDOWN_GRACE
                );
                break;
            }
        }
    }
}

fn invalid_transition(task_id: &str, from: TaskState, action: &'static str) -> SchedulerError {
    SchedulerError::InvalidTransition {
        id: task_id.to_string(),
        from,
        action,
    }
}
