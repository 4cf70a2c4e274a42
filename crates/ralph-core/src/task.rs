use crate::db::Store;
use crate::error::{RalphError, Result};
use crate::types::{TaskKind, TaskStatus};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// Finished tasks kept by [`Store::cleanup_tasks`].
pub const KEEP_FINISHED_TASKS: usize = 50;

/// A long-running LLM-backed operation queued from the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub version: Option<String>,
    pub params: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Task {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Task {
            id: row.get("id")?,
            kind: row.get("kind")?,
            status: row.get("status")?,
            version: row.get("version_id")?,
            params: row.get("params")?,
            result: row.get("result")?,
            error: row.get("error")?,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            read_at: row.get("read_at")?,
            deleted_at: row.get("deleted_at")?,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskFilter {
    #[serde(default, rename = "type")]
    pub kind: Option<TaskKind>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    /// Only queued or running tasks.
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub include_deleted: bool,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// `PATCH /tasks/{id}` actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    Read,
    Delete,
    Restore,
}

impl std::str::FromStr for TaskAction {
    type Err = RalphError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "read" => Ok(TaskAction::Read),
            "delete" => Ok(TaskAction::Delete),
            "restore" => Ok(TaskAction::Restore),
            _ => Err(RalphError::InvalidAction {
                action: s.to_string(),
                expected: "read, delete, restore".into(),
            }),
        }
    }
}

impl Store {
    pub fn create_task(
        &self,
        kind: TaskKind,
        version: Option<&str>,
        params: serde_json::Value,
    ) -> Result<Task> {
        let id = uuid::Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO tasks (id, kind, status, version_id, params, created_at)
             VALUES (?1, ?2, 'queued', ?3, ?4, ?5)",
            params![id, kind, version, params, Utc::now()],
        )?;
        tracing::info!(task = %id, kind = %kind, "task queued");
        self.get_task(&id)
    }

    pub fn get_task(&self, id: &str) -> Result<Task> {
        self.conn
            .query_row("SELECT * FROM tasks WHERE id = ?1", params![id], Task::from_row)
            .optional()?
            .ok_or_else(|| RalphError::TaskNotFound(id.to_string()))
    }

    /// Tasks newest first.
    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM tasks ORDER BY created_at DESC, rowid DESC")?;
        let tasks = stmt
            .query_map([], Task::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let iter = tasks
            .into_iter()
            .filter(|t| filter.include_deleted || t.deleted_at.is_none())
            .filter(|t| filter.kind.map_or(true, |k| t.kind == k))
            .filter(|t| filter.status.map_or(true, |s| t.status == s))
            .filter(|t| !filter.active || !t.status.is_finished());
        Ok(match filter.limit {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        })
    }

    /// Oldest queued task, if nothing is running.
    pub fn next_queued_task(&self) -> Result<Option<Task>> {
        let running: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE status = 'running'",
            [],
            |row| row.get(0),
        )?;
        if running > 0 {
            return Ok(None);
        }
        Ok(self
            .conn
            .query_row(
                "SELECT * FROM tasks WHERE status = 'queued' AND deleted_at IS NULL
                 ORDER BY created_at, rowid LIMIT 1",
                [],
                Task::from_row,
            )
            .optional()?)
    }

    pub fn start_task(&self, id: &str) -> Result<Task> {
        let task = self.get_task(id)?;
        if task.status != TaskStatus::Queued {
            return Err(RalphError::invalid_field(
                "status",
                format!("task {id} is {}, not queued", task.status),
            ));
        }
        self.conn.execute(
            "UPDATE tasks SET status = 'running', started_at = ?1 WHERE id = ?2",
            params![Utc::now(), id],
        )?;
        self.get_task(id)
    }

    pub fn complete_task(&self, id: &str, result: serde_json::Value) -> Result<Task> {
        self.get_task(id)?;
        self.conn.execute(
            "UPDATE tasks SET status = 'complete', result = ?1, error = NULL, completed_at = ?2
             WHERE id = ?3",
            params![result, Utc::now(), id],
        )?;
        tracing::info!(task = id, "task complete");
        self.get_task(id)
    }

    pub fn fail_task(&self, id: &str, error: &str) -> Result<Task> {
        self.get_task(id)?;
        self.conn.execute(
            "UPDATE tasks SET status = 'failed', error = ?1, completed_at = ?2 WHERE id = ?3",
            params![error, Utc::now(), id],
        )?;
        tracing::warn!(task = id, "task failed: {error}");
        self.get_task(id)
    }

    /// Apply a read/delete/restore action. Deletion is soft.
    pub fn apply_task_action(&self, id: &str, action: TaskAction) -> Result<Task> {
        self.get_task(id)?;
        match action {
            TaskAction::Read => self.conn.execute(
                "UPDATE tasks SET read_at = COALESCE(read_at, ?1) WHERE id = ?2",
                params![Utc::now(), id],
            )?,
            TaskAction::Delete => self.conn.execute(
                "UPDATE tasks SET deleted_at = COALESCE(deleted_at, ?1) WHERE id = ?2",
                params![Utc::now(), id],
            )?,
            TaskAction::Restore => self
                .conn
                .execute("UPDATE tasks SET deleted_at = NULL WHERE id = ?1", params![id])?,
        };
        self.get_task(id)
    }

    pub fn mark_all_tasks_read(&self) -> Result<usize> {
        Ok(self.conn.execute(
            "UPDATE tasks SET read_at = ?1
             WHERE read_at IS NULL AND status IN ('complete', 'failed')",
            params![Utc::now()],
        )?)
    }

    /// Finished tasks not yet read and not deleted.
    pub fn unread_task_count(&self) -> Result<u32> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM tasks
             WHERE read_at IS NULL AND deleted_at IS NULL AND status IN ('complete', 'failed')",
            [],
            |row| row.get(0),
        )?)
    }

    pub fn delete_task(&self, id: &str) -> Result<()> {
        let removed = self
            .conn
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        if removed == 0 {
            return Err(RalphError::TaskNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Drop all but the newest `keep` finished tasks.
    pub fn cleanup_tasks(&self, keep: usize) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM tasks WHERE status IN ('complete', 'failed') AND id NOT IN (
                 SELECT id FROM tasks WHERE status IN ('complete', 'failed')
                 ORDER BY completed_at DESC, rowid DESC LIMIT ?1
             )",
            params![keep as i64],
        )?;
        if removed > 0 {
            tracing::debug!(removed, "old tasks cleaned up");
        }
        Ok(removed)
    }

    /// Tasks left `running` by a previous process go back to `failed`.
    pub fn fail_interrupted_tasks(&self) -> Result<usize> {
        Ok(self.conn.execute(
            "UPDATE tasks SET status = 'failed', error = 'interrupted by restart', completed_at = ?1
             WHERE status = 'running'",
            params![Utc::now()],
        )?)
    }
}
