//! SQLite-backed task store.

use super::schema::TASKS_VERSIONED_SCHEMAS;
use super::{StoreError, StoreResult, TaskStore};
use crate::sqlite_persistence::open_versioned;
use crate::task::{
    now_millis, FailureKind, LastError, Pagination, QueueStats, Task, TaskFilter, TaskOptions,
    TaskPriority, TaskState,
};
use anyhow::{Context, Result};
use rusqlite::types::{ToSql, Type};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

const TERMINAL_CLAUSE: &str =
    "(state IN ('COMPLETED', 'CANCELLED') OR (state = 'FAILED' AND retry_at IS NULL))";

const QUEUE_ORDER: &str = "ORDER BY priority ASC, created_at ASC, id ASC";

/// SQLite-backed task store.
///
/// Cloning is cheap and shares the underlying connection.
#[derive(Clone)]
pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTaskStore {
    /// Open an existing task database or create a new one with the current schema.
    ///
    /// The database runs in WAL mode so a CLI process and a running scheduler
    /// can share it.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open task database at {:?}", db_path))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
        debug!("Task database journal mode: {}", journal_mode);

        open_versioned(&conn, TASKS_VERSIONED_SCHEMAS, "task")?;
        info!("Opened task database at {:?}", db_path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store, used by tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        open_versioned(&conn, TASKS_VERSIONED_SCHEMAS, "task")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<Task> {
        let state_str: String = row.get("state")?;
        let state = TaskState::from_db_str(&state_str).ok_or_else(|| {
            conversion_error(format!("unknown task state '{}'", state_str))
        })?;

        let options_json: String = row.get("options")?;
        let mut options: TaskOptions = serde_json::from_str(&options_json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;
        if let Some(priority) = TaskPriority::from_i32(row.get("priority")?) {
            options.priority = priority;
        }

        let last_error = match (
            row.get::<_, Option<String>>("error_kind")?,
            row.get::<_, Option<String>>("error_message")?,
        ) {
            (Some(kind), Some(message)) => Some(LastError {
                kind: FailureKind::from_str(&kind).ok_or_else(|| {
                    conversion_error(format!("unknown failure kind '{}'", kind))
                })?,
                message,
            }),
            _ => None,
        };

        Ok(Task {
            id: row.get("id")?,
            source_url: row.get("source_url")?,
            platform: row.get("platform")?,
            options,
            state,
            progress: row.get("progress")?,
            bytes_total: row.get("bytes_total")?,
            bytes_done: row.get("bytes_done")?,
            attempt_count: row.get("attempt_count")?,
            max_attempts: row.get("max_attempts")?,
            last_error,
            retry_at: row.get("retry_at")?,
            resume_requested: row.get::<_, i64>("resume_requested")? != 0,
            title: row.get("title")?,
            duration_secs: row.get("duration_secs")?,
            output_path: row.get("output_path")?,
            final_path: row.get("final_path")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
        })
    }

    fn query_tasks(
        conn: &Connection,
        sql: &str,
        params: &[&dyn ToSql],
    ) -> StoreResult<Vec<Task>> {
        let mut stmt = conn.prepare(sql)?;
        let tasks = stmt
            .query_map(params, Self::row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }
}

fn conversion_error(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, Type::Text, message.into())
}

impl TaskStore for SqliteTaskStore {
    fn create(&self, task: &Task) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let options = serde_json::to_string(&task.options)?;
        let result = conn.execute(
            r#"INSERT INTO tasks (
                id, source_url, platform, options, priority, state, progress,
                bytes_total, bytes_done, attempt_count, max_attempts,
                error_kind, error_message, retry_at, resume_requested,
                title, duration_secs, output_path, final_path,
                created_at, updated_at, started_at, completed_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23
            )"#,
            params![
                task.id,
                task.source_url,
                task.platform,
                options,
                task.options.priority.as_i32(),
                task.state.as_db_str(),
                task.progress,
                task.bytes_total,
                task.bytes_done,
                task.attempt_count,
                task.max_attempts,
                task.last_error.as_ref().map(|e| e.kind.as_str()),
                task.last_error.as_ref().map(|e| e.message.as_str()),
                task.retry_at,
                task.resume_requested,
                task.title,
                task.duration_secs,
                task.output_path,
                task.final_path,
                task.created_at,
                task.updated_at,
                task.started_at,
                task.completed_at,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::AlreadyExists(task.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn update(&self, task: &Task, expected_state: TaskState) -> StoreResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let options = serde_json::to_string(&task.options)?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            r#"UPDATE tasks SET
                options = ?3, priority = ?4, state = ?5, progress = ?6,
                bytes_total = ?7, bytes_done = ?8, attempt_count = ?9, max_attempts = ?10,
                error_kind = ?11, error_message = ?12, retry_at = ?13, resume_requested = ?14,
                title = ?15, duration_secs = ?16, output_path = ?17, final_path = ?18,
                updated_at = ?19, started_at = ?20, completed_at = ?21
               WHERE id = ?1 AND state = ?2"#,
            params![
                task.id,
                expected_state.as_db_str(),
                options,
                task.options.priority.as_i32(),
                task.state.as_db_str(),
                task.progress,
                task.bytes_total,
                task.bytes_done,
                task.attempt_count,
                task.max_attempts,
                task.last_error.as_ref().map(|e| e.kind.as_str()),
                task.last_error.as_ref().map(|e| e.message.as_str()),
                task.retry_at,
                task.resume_requested,
                task.title,
                task.duration_secs,
                task.output_path,
                task.final_path,
                now_millis().max(task.updated_at),
                task.started_at,
                task.completed_at,
            ],
        )?;

        if changed == 0 {
            let actual: Option<String> = tx
                .query_row("SELECT state FROM tasks WHERE id = ?1", [&task.id], |row| {
                    row.get(0)
                })
                .optional()?;
            return match actual {
                None => Err(StoreError::NotFound(task.id.clone())),
                Some(actual) => Err(StoreError::Conflict {
                    id: task.id.clone(),
                    expected: expected_state,
                    actual: TaskState::from_db_str(&actual).ok_or_else(|| {
                        anyhow::anyhow!("Unknown task state '{}' in database", actual)
                    })?,
                }),
            };
        }
        tx.commit()?;
        Ok(())
    }

    fn get(&self, id: &str) -> StoreResult<Option<Task>> {
        let conn = self.conn.lock().unwrap();
        let task = conn
            .query_row("SELECT * FROM tasks WHERE id = ?1", [id], Self::row_to_task)
            .optional()?;
        Ok(task)
    }

    fn list(&self, filter: &TaskFilter, page: Pagination) -> StoreResult<Vec<Task>> {
        let conn = self.conn.lock().unwrap();

        let mut conditions = Vec::new();
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(state) = filter.state {
            values.push(Box::new(state.as_db_str()));
            conditions.push(format!("state = ?{}", values.len()));
        }
        if let Some(platform) = &filter.platform {
            values.push(Box::new(platform.clone()));
            conditions.push(format!("platform = ?{}", values.len()));
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        values.push(Box::new(page.limit as i64));
        let limit_idx = values.len();
        values.push(Box::new(page.offset as i64));
        let offset_idx = values.len();

        let sql = format!(
            "SELECT * FROM tasks {} {} LIMIT ?{} OFFSET ?{}",
            where_clause, QUEUE_ORDER, limit_idx, offset_idx
        );
        let params: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
        Self::query_tasks(&conn, &sql, &params)
    }

    fn delete(&self, id: &str) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM tasks WHERE id = ?1", [id])?;
        Ok(deleted > 0)
    }

    fn list_admission_candidates(&self, now: i64) -> StoreResult<Vec<Task>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            r#"SELECT * FROM tasks
               WHERE state = 'PENDING'
                  OR (state = 'PAUSED' AND resume_requested = 1)
                  OR (state = 'FAILED' AND retry_at IS NOT NULL AND retry_at <= ?1)
               {}"#,
            QUEUE_ORDER
        );
        Self::query_tasks(&conn, &sql, &[&now as &dyn ToSql])
    }

    fn list_non_terminal(&self) -> StoreResult<Vec<Task>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT * FROM tasks WHERE NOT {} {}",
            TERMINAL_CLAUSE, QUEUE_ORDER
        );
        Self::query_tasks(&conn, &sql, &[])
    }

    fn reset_active_to_pending(&self) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let ids = {
            let mut stmt = tx.prepare("SELECT id FROM tasks WHERE state = 'ACTIVE' ORDER BY id")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        tx.execute(
            "UPDATE tasks SET state = 'PENDING', attempt_count = MAX(attempt_count - 1, 0),
                updated_at = ?1
             WHERE state = 'ACTIVE'",
            [now_millis()],
        )?;
        tx.commit()?;
        Ok(ids)
    }

    fn next_retry_at(&self) -> StoreResult<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        let next = conn.query_row(
            "SELECT MIN(retry_at) FROM tasks WHERE state = 'FAILED' AND retry_at IS NOT NULL",
            [],
            |row| row.get::<_, Option<i64>>(0),
        )?;
        Ok(next)
    }

    fn stats(&self) -> StoreResult<QueueStats> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM tasks GROUP BY state")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stats = QueueStats::default();
        for (state, count) in rows {
            let count = count as usize;
            match TaskState::from_db_str(&state) {
                Some(TaskState::Pending) => stats.pending = count,
                Some(TaskState::Active) => stats.active = count,
                Some(TaskState::Paused) => stats.paused = count,
                Some(TaskState::Completed) => stats.completed = count,
                Some(TaskState::Failed) => stats.failed = count,
                Some(TaskState::Cancelled) => stats.cancelled = count,
                None => {}
            }
            stats.total += count;
        }
        Ok(stats)
    }

    fn delete_terminal_before(&self, cutoff: i64) -> StoreResult<usize> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "DELETE FROM tasks WHERE {} AND COALESCE(completed_at, updated_at) < ?1",
            TERMINAL_CLAUSE
        );
        Ok(conn.execute(&sql, [cutoff])?)
    }
}
