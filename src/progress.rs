//! Outbound progress and state-change events.

use crate::task::TaskState;
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    StateChanged {
        old: TaskState,
        new: TaskState,
    },
    ProgressTick {
        bytes_done: u64,
        bytes_total: Option<u64>,
    },
}

/// An event together with the task it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskEvent {
    pub task_id: String,
    #[serde(flatten)]
    pub event: ProgressEvent,
}

/// Receives task events for delivery to subscribers.
///
/// `notify` is fire-and-forget and must never block; delivery failures stay
/// inside the sink.
pub trait ProgressSink: Send + Sync {
    fn notify(&self, task_id: &str, event: ProgressEvent);
}

/// Sink that discards every event.
pub struct NoOpProgressSink;

impl ProgressSink for NoOpProgressSink {
    fn notify(&self, _task_id: &str, _event: ProgressEvent) {}
}

/// Fans events out to any number of subscribers over a broadcast channel.
///
/// Slow subscribers lose the oldest events rather than slowing the scheduler.
#[derive(Clone)]
pub struct BroadcastProgressSink {
    sender: broadcast::Sender<TaskEvent>,
}

impl BroadcastProgressSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastProgressSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl ProgressSink for BroadcastProgressSink {
    fn notify(&self, task_id: &str, event: ProgressEvent) {
        // No subscribers is not an error.
        let _ = self.sender.send(TaskEvent {
            task_id: task_id.to_string(),
            event,
        });
    }
}
