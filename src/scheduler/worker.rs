//! Runs one admitted task end to end: resolve, transfer, convert, finalize.
//!
//! The worker owns the task's transient fields while it holds the lease.
//! Every write goes through the store with `Active` as the expected state, so
//! a pause or cancel made elsewhere shows up as a conflict and ends the run.

use super::service::SchedulerInner;
use crate::config::SchedulerSettings;
use crate::converter::ConversionError;
use crate::extractor::{ExtractorError, StreamDescriptor};
use crate::lease::StopSignal;
use crate::task::{now_millis, FailureKind, LastError, Task, TaskState};
use crate::task_store::StoreError;
use crate::transfer::{TransferError, TransferRequest, TransferTick};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, error, info, warn};

/// Why a run ended early.
enum Interrupt {
    /// Stop signal fired or the lease was lost; the store says what happened.
    Stopped,
    Failed(Failure),
}

/// A classified execution failure.
struct Failure {
    kind: FailureKind,
    message: String,
    /// Whether the partial output is still worth resuming from.
    keep_partial: bool,
    /// Set when the source asked us to slow down, with its requested delay.
    rate_limited: Option<Option<Duration>>,
}

impl Failure {
    fn recoverable(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Recoverable,
            message: message.into(),
            keep_partial: true,
            rate_limited: None,
        }
    }

    fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Fatal,
            ..Self::recoverable(message)
        }
    }

    fn keep_partial(mut self, keep: bool) -> Self {
        self.keep_partial = keep;
        self
    }

    fn from_extractor(e: ExtractorError) -> Self {
        let rate_limited = match &e {
            ExtractorError::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        };
        Self {
            kind: e.kind(),
            message: e.to_string(),
            keep_partial: true,
            rate_limited,
        }
    }

    fn from_transfer(e: TransferError, resumable: bool) -> Self {
        let rate_limited = match &e {
            TransferError::Http { retry_after, .. } if e.is_rate_limited() => Some(*retry_after),
            _ => None,
        };
        let keep_partial = resumable && !matches!(e, TransferError::SizeMismatch { .. });
        Self {
            kind: e.kind(),
            message: e.to_string(),
            keep_partial,
            rate_limited,
        }
    }

    fn from_conversion(e: ConversionError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
            keep_partial: true,
            rate_limited: None,
        }
    }
}

pub(super) async fn run(inner: Arc<SchedulerInner>, mut task: Task, stop: StopSignal) {
    let task_id = task.id.clone();
    match execute(&inner, &mut task, &stop).await {
        Ok(()) => {}
        Err(Interrupt::Stopped) => settle(&inner, &task).await,
        Err(Interrupt::Failed(failure)) => fail_attempt(&inner, &mut task, &stop, failure).await,
    }
    inner.release(&task_id);
}

async fn execute(inner: &SchedulerInner, task: &mut Task, stop: &StopSignal) -> Result<(), Interrupt> {
    let settings = &inner.settings;

    let manifest = tokio::select! {
        biased;
        _ = stop.stopped() => return Err(Interrupt::Stopped),
        result = tokio::time::timeout(
            settings.extract_timeout,
            inner.extractor.resolve(&task.source_url, &task.options),
        ) => match result {
            Ok(Ok(manifest)) => manifest,
            Ok(Err(e)) => return Err(Interrupt::Failed(Failure::from_extractor(e))),
            Err(_) => {
                return Err(Interrupt::Failed(Failure::recoverable(format!(
                    "extractor timed out after {}s",
                    settings.extract_timeout.as_secs()
                ))))
            }
        },
    };

    let stream = manifest
        .select(task.options.quality)
        .cloned()
        .ok_or_else(|| {
            Interrupt::Failed(Failure::fatal(format!(
                "no stream matches quality {}",
                task.options.quality
            )))
        })?;
    debug!(
        "Task {}: selected {} stream ({})",
        task.id,
        stream.quality_label.as_deref().unwrap_or("unlabelled"),
        stream.url
    );

    task.title = manifest.title.clone().or(task.title.take());
    task.duration_secs = manifest.duration_secs.or(task.duration_secs);
    if let Some(size) = stream.size {
        task.bytes_total = Some(size);
        if let Some(done) = task.bytes_done {
            task.record_bytes(done, Some(size));
        }
    }
    let output_path = match &task.output_path {
        Some(path) => PathBuf::from(path),
        None => {
            let path = choose_output_path(settings, task, &stream).await;
            task.output_path = Some(path.to_string_lossy().into_owned());
            path
        }
    };
    persist(inner, task)?;

    let resume_offset = partial_len(&output_path).await;
    if resume_offset > 0 && task.bytes_total == Some(resume_offset) {
        debug!("Task {}: output already complete on disk", task.id);
    } else {
        transfer(inner, task, stop, stream, &output_path, resume_offset).await?;
    }

    let len = verify_output(task, &output_path).await?;
    task.record_bytes(len, Some(task.bytes_total.unwrap_or(len)));

    let final_path = match conversion_target(task, &output_path) {
        Some(format) => convert(inner, task, stop, &output_path, &format).await?,
        None => output_path,
    };

    if stop.is_stopped() {
        return Err(Interrupt::Stopped);
    }
    let now = now_millis();
    task.state = TaskState::Completed;
    task.progress = 1.0;
    task.final_path = Some(final_path.to_string_lossy().into_owned());
    task.last_error = None;
    task.retry_at = None;
    task.completed_at = Some(now);
    persist(inner, task)?;

    inner.notify_state(&task.id, TaskState::Active, TaskState::Completed);
    info!("Task {} completed: {:?}", task.id, final_path);
    Ok(())
}

/// Write the worker's view of the task, expecting it to still be `Active`.
fn persist(inner: &SchedulerInner, task: &mut Task) -> Result<(), Interrupt> {
    task.updated_at = now_millis();
    match inner.store.update(task, TaskState::Active) {
        Ok(()) => Ok(()),
        Err(StoreError::Conflict { actual, .. }) => {
            debug!("Task {} is now {}, giving up the lease", task.id, actual);
            Err(Interrupt::Stopped)
        }
        Err(StoreError::NotFound(_)) => Err(Interrupt::Stopped),
        Err(e) => Err(Interrupt::Failed(Failure::recoverable(format!(
            "could not persist task: {}",
            e
        )))),
    }
}

async fn transfer(
    inner: &SchedulerInner,
    task: &mut Task,
    stop: &StopSignal,
    source: StreamDescriptor,
    output_path: &Path,
    resume_offset: u64,
) -> Result<(), Interrupt> {
    let stall_window = inner.settings.stall_window;
    let request = TransferRequest {
        task_id: task.id.clone(),
        source,
        output_path: output_path.to_path_buf(),
        resume_offset,
    };
    let mut ticks = inner.transfer.transfer(request, stop.clone());
    // Range support reported by this run. Until `Started` arrives the file on
    // disk is still what earlier attempts left, so it is kept.
    let mut resumable: Option<bool> = None;

    loop {
        let next = match tokio::time::timeout(stall_window, ticks.next()).await {
            Ok(next) => next,
            Err(_) => {
                return Err(Interrupt::Failed(
                    Failure::recoverable(format!(
                        "transfer stalled: no progress for {}s",
                        stall_window.as_secs()
                    ))
                    .keep_partial(resumable.unwrap_or(true)),
                ));
            }
        };

        match next {
            None => {
                return Err(Interrupt::Failed(
                    Failure::recoverable("transfer ended before finishing")
                        .keep_partial(resumable.unwrap_or(true)),
                ))
            }
            Some(Err(e)) => {
                return Err(Interrupt::Failed(Failure::from_transfer(
                    e,
                    resumable.unwrap_or(true),
                )))
            }
            Some(Ok(TransferTick::Started {
                offset,
                total,
                resumable: supports_ranges,
            })) => {
                resumable = Some(supports_ranges);
                if offset < resume_offset {
                    warn!(
                        "Task {}: source restarted at byte {}, discarding {} bytes",
                        task.id,
                        offset,
                        resume_offset - offset
                    );
                }
                task.record_bytes(offset, total);
                persist(inner, task)?;
                inner.notify_progress(task);
            }
            Some(Ok(TransferTick::Progress {
                bytes_done,
                bytes_total,
            })) => {
                task.record_bytes(bytes_done, bytes_total);
                persist(inner, task)?;
                inner.notify_progress(task);
            }
            Some(Ok(TransferTick::Finished { bytes_done })) => {
                task.record_bytes(bytes_done, None);
                return Ok(());
            }
            Some(Ok(TransferTick::Stopped { bytes_done, reason })) => {
                debug!("Task {}: transfer stopped ({:?})", task.id, reason);
                task.record_bytes(bytes_done, None);
                return Err(Interrupt::Stopped);
            }
        }
    }
}

/// Output must exist, be non-empty, and match the expected size when known.
async fn verify_output(task: &Task, path: &Path) -> Result<u64, Interrupt> {
    let invalid = |message: String| {
        Interrupt::Failed(Failure::recoverable(message).keep_partial(false))
    };
    let len = fs::metadata(path)
        .await
        .map_err(|e| invalid(format!("output {:?} is missing: {}", path, e)))?
        .len();
    if len == 0 {
        return Err(invalid(format!("output {:?} is empty", path)));
    }
    if let Some(total) = task.bytes_total {
        if len != total {
            return Err(invalid(format!(
                "output has {} bytes, expected {}",
                len, total
            )));
        }
    }
    Ok(len)
}

async fn convert(
    inner: &SchedulerInner,
    task: &Task,
    stop: &StopSignal,
    input: &Path,
    format: &str,
) -> Result<PathBuf, Interrupt> {
    info!("Task {}: converting to {}", task.id, format);
    let converted = tokio::select! {
        biased;
        _ = stop.stopped() => return Err(Interrupt::Stopped),
        result = inner.converter.convert(input, format) => {
            result.map_err(|e| Interrupt::Failed(Failure::from_conversion(e)))?
        }
    };

    let valid = fs::metadata(&converted)
        .await
        .map(|m| m.len() > 0)
        .unwrap_or(false);
    if !valid {
        return Err(Interrupt::Failed(Failure::recoverable(format!(
            "converted output {:?} is missing or empty",
            converted
        ))));
    }
    if converted != input {
        if let Err(e) = fs::remove_file(input).await {
            warn!("Task {}: failed to remove {:?}: {}", task.id, input, e);
        }
    }
    Ok(converted)
}

/// Record the outcome of an attempt that failed and decide whether to retry.
async fn fail_attempt(inner: &SchedulerInner, task: &mut Task, stop: &StopSignal, failure: Failure) {
    if stop.is_stopped() {
        debug!(
            "Task {}: ignoring failure after stop: {}",
            task.id, failure.message
        );
        settle(inner, task).await;
        return;
    }

    let policy = &inner.retry_policy;
    let retry = policy.should_retry(failure.kind, task.attempt_count);
    let delay = policy.retry_delay(
        task.attempt_count.saturating_sub(1),
        failure.rate_limited.flatten(),
    );
    if failure.rate_limited.is_some() {
        warn!(
            "Platform {} is rate limiting, holding its admissions for {:?}",
            task.platform, delay
        );
        inner.throttler.cool_down(&task.platform, delay).await;
    }

    let discard = !retry || !failure.keep_partial;
    let now = now_millis();
    task.state = TaskState::Failed;
    task.last_error = Some(LastError {
        kind: failure.kind,
        message: failure.message.clone(),
    });
    task.retry_at = retry.then(|| now + delay.as_millis() as i64);
    if discard {
        task.bytes_done = None;
        task.progress = 0.0;
    }
    task.updated_at = now;

    match inner.store.update(task, TaskState::Active) {
        Ok(()) => {}
        Err(StoreError::Conflict { .. }) | Err(StoreError::NotFound(_)) => {
            settle(inner, task).await;
            return;
        }
        Err(e) => {
            error!("Task {}: failed to record failure: {}", task.id, e);
            return;
        }
    }

    if discard {
        remove_outputs(task).await;
    }
    inner.notify_state(&task.id, TaskState::Active, TaskState::Failed);
    if retry {
        warn!(
            "Task {} failed (attempt {}/{}), retrying in {:?}: {}",
            task.id, task.attempt_count, task.max_attempts, delay, failure.message
        );
    } else {
        error!(
            "Task {} failed permanently after {} attempts ({}): {}",
            task.id,
            task.attempt_count,
            failure.kind.as_str(),
            failure.message
        );
    }
}

/// After a stop or a lost lease, reconcile with whatever the store says now.
async fn settle(inner: &SchedulerInner, task: &Task) {
    let stored = match inner.store.get(&task.id) {
        Ok(Some(stored)) => stored,
        Ok(None) => {
            debug!("Task {} was deleted while running", task.id);
            remove_outputs(task).await;
            return;
        }
        Err(e) => {
            error!("Task {}: failed to re-read after stop: {}", task.id, e);
            return;
        }
    };

    match stored.state {
        TaskState::Cancelled => {
            remove_outputs(task).await;
            info!("Task {} stopped, partial output removed", task.id);
        }
        // Paused, or still Active because the process is shutting down.
        TaskState::Paused | TaskState::Active => {
            let mut updated = stored.clone();
            updated.title = task.title.clone().or(updated.title);
            updated.duration_secs = task.duration_secs.or(updated.duration_secs);
            updated.output_path = task.output_path.clone().or(updated.output_path);
            if let Some(done) = task.bytes_done {
                updated.record_bytes(done, task.bytes_total);
            }
            updated.updated_at = now_millis();
            match inner.store.update(&updated, stored.state) {
                Ok(()) => debug!(
                    "Task {} stopped at {} bytes ({})",
                    task.id,
                    updated.bytes_done.unwrap_or(0),
                    stored.state
                ),
                Err(e) => debug!("Task {}: could not record final progress: {}", task.id, e),
            }
        }
        _ => {}
    }
}

/// Delete the raw and converted outputs of `task`, if any.
pub(super) async fn remove_outputs(task: &Task) {
    let Some(raw) = task.output_path.as_deref().map(PathBuf::from) else {
        return;
    };
    let mut paths = vec![raw.clone()];
    if let Some(format) = &task.options.target_format {
        let converted = raw.with_extension(format.to_ascii_lowercase());
        if converted != raw {
            paths.push(converted);
        }
    }
    for path in paths {
        match fs::remove_file(&path).await {
            Ok(()) => debug!("Task {}: removed {:?}", task.id, path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Task {}: failed to remove {:?}: {}", task.id, path, e),
        }
    }
}

async fn partial_len(path: &Path) -> u64 {
    fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

/// Pick a destination that does not clobber another task's file.
async fn choose_output_path(
    settings: &SchedulerSettings,
    task: &Task,
    stream: &StreamDescriptor,
) -> PathBuf {
    let dir = task
        .options
        .output_dir
        .as_deref()
        .map(PathBuf::from)
        .unwrap_or_else(|| settings.default_output_dir.clone());
    let stem = task
        .options
        .filename
        .as_deref()
        .or(task.title.as_deref())
        .map(|name| sanitize_filename::sanitize(name.trim()))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| task.id.clone());
    let extension = stream.file_extension();

    let path = dir.join(format!("{}.{}", stem, extension));
    if fs::try_exists(&path).await.unwrap_or(false) {
        let suffix = &task.id[task.id.len().saturating_sub(8)..];
        dir.join(format!("{}-{}.{}", stem, suffix, extension))
    } else {
        path
    }
}

/// Format to convert to, if it differs from what was downloaded.
fn conversion_target(task: &Task, raw: &Path) -> Option<String> {
    let format = task.options.target_format.as_ref()?.to_ascii_lowercase();
    let current = raw
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    (current.as_deref() != Some(format.as_str())).then_some(format)
}
