//! Task lifecycle states and the edges allowed between them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a download task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Active,
    Paused,
    Completed, // terminal
    Failed,    // terminal once no retry is scheduled
    Cancelled, // terminal
}

impl TaskState {
    pub const ALL: [TaskState; 6] = [
        TaskState::Pending,
        TaskState::Active,
        TaskState::Paused,
        TaskState::Completed,
        TaskState::Failed,
        TaskState::Cancelled,
    ];

    pub fn as_db_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Active => "ACTIVE",
            TaskState::Paused => "PAUSED",
            TaskState::Completed => "COMPLETED",
            TaskState::Failed => "FAILED",
            TaskState::Cancelled => "CANCELLED",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(TaskState::Pending),
            "ACTIVE" => Some(TaskState::Active),
            "PAUSED" => Some(TaskState::Paused),
            "COMPLETED" => Some(TaskState::Completed),
            "FAILED" => Some(TaskState::Failed),
            "CANCELLED" => Some(TaskState::Cancelled),
            _ => None,
        }
    }

    /// Parses user input such as `pending` or `Active`.
    pub fn parse(s: &str) -> Option<Self> {
        Self::from_db_str(&s.trim().to_ascii_uppercase())
    }

    /// Whether the lifecycle graph has an edge from `self` to `next`.
    ///
    /// Whether a `Failed` task may still leave `Failed` depends on its retry
    /// schedule, so callers holding a full task should go through
    /// [`Task::allows`](super::Task::allows) instead.
    pub fn has_edge_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Active)
                | (Active, Completed)
                | (Active, Failed)
                | (Active, Paused)
                | (Paused, Active)
                | (Failed, Active)
                | (Pending, Cancelled)
                | (Active, Cancelled)
                | (Paused, Cancelled)
                | (Failed, Cancelled)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Pending => "Pending",
            TaskState::Active => "Active",
            TaskState::Paused => "Paused",
            TaskState::Completed => "Completed",
            TaskState::Failed => "Failed",
            TaskState::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TaskState::*;

    #[test]
    fn test_db_str_round_trip() {
        for state in TaskState::ALL {
            assert_eq!(TaskState::from_db_str(state.as_db_str()), Some(state));
        }
        assert_eq!(TaskState::from_db_str("RUNNING"), None);
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!(TaskState::parse("paused"), Some(Paused));
        assert_eq!(TaskState::parse(" Active "), Some(Active));
        assert_eq!(TaskState::parse("done"), None);
    }

    #[test]
    fn test_allowed_edges() {
        let allowed = [
            (Pending, Active),
            (Active, Completed),
            (Active, Failed),
            (Active, Paused),
            (Paused, Active),
            (Failed, Active),
            (Pending, Cancelled),
            (Active, Cancelled),
            (Paused, Cancelled),
            (Failed, Cancelled),
        ];
        for from in TaskState::ALL {
            for to in TaskState::ALL {
                assert_eq!(
                    from.has_edge_to(to),
                    allowed.contains(&(from, to)),
                    "edge {} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_no_edges_leave_completed_or_cancelled() {
        for to in TaskState::ALL {
            assert!(!Completed.has_edge_to(to));
            assert!(!Cancelled.has_edge_to(to));
        }
    }

    #[test]
    fn test_pending_cannot_skip_to_terminal_success() {
        assert!(!Pending.has_edge_to(Completed));
        assert!(!Pending.has_edge_to(Paused));
        assert!(!Paused.has_edge_to(Completed));
    }
}
