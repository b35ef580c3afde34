//! Database schema for tasks.db.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

/// One row per task. Timestamps are Unix milliseconds.
const TASKS_TABLE_V0: Table = Table {
    name: "tasks",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("source_url", &SqlType::Text, non_null = true),
        sqlite_column!("platform", &SqlType::Text, non_null = true),
        sqlite_column!("options", &SqlType::Text, non_null = true),
        sqlite_column!("priority", &SqlType::Integer, non_null = true),
        sqlite_column!("state", &SqlType::Text, non_null = true),
        sqlite_column!(
            "progress",
            &SqlType::Real,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("bytes_total", &SqlType::Integer),
        sqlite_column!("bytes_done", &SqlType::Integer),
        sqlite_column!(
            "attempt_count",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("max_attempts", &SqlType::Integer, non_null = true),
        sqlite_column!("error_kind", &SqlType::Text),
        sqlite_column!("error_message", &SqlType::Text),
        sqlite_column!("retry_at", &SqlType::Integer),
        sqlite_column!(
            "resume_requested",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("title", &SqlType::Text),
        sqlite_column!("duration_secs", &SqlType::Integer),
        sqlite_column!("output_path", &SqlType::Text),
        sqlite_column!("final_path", &SqlType::Text),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("updated_at", &SqlType::Integer, non_null = true),
        sqlite_column!("started_at", &SqlType::Integer),
        sqlite_column!("completed_at", &SqlType::Integer),
    ],
    indices: &[
        ("idx_tasks_queue", "state, priority, created_at, id"),
        ("idx_tasks_created", "created_at, id"),
        ("idx_tasks_platform", "platform"),
        ("idx_tasks_retry", "retry_at"),
    ],
};

pub const TASKS_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[TASKS_TABLE_V0],
    migration: None,
}];
