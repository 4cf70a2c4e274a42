use crate::db::Store;
use crate::error::Result;
use crate::prd::Progress;
use crate::types::RunOutcome;
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};

/// One external agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub id: i64,
    pub story_id: String,
    pub attempt: u32,
    pub status: RunOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub error_message: Option<String>,
}

impl ExecutionLogEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(ExecutionLogEntry {
            id: row.get("id")?,
            story_id: row.get("story_id")?,
            attempt: row.get("attempt")?,
            status: row.get("status")?,
            started_at: row.get("started_at")?,
            finished_at: row.get("finished_at")?,
            duration_seconds: row.get("duration_seconds")?,
            error_message: row.get("error_message")?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoryMetrics {
    pub story_id: String,
    pub runs: u32,
    pub failures: u32,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Metrics {
    pub runs: u32,
    pub completed: u32,
    pub failed: u32,
    pub total_duration_seconds: f64,
    pub stories: Progress,
    pub per_story: Vec<StoryMetrics>,
}

impl Store {
    /// Open a log row for an agent call and return its id.
    pub fn log_run_started(&self, story_id: &str, attempt: u32) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO execution_log (story_id, attempt, status, started_at)
             VALUES (?1, ?2, 'running', ?3)",
            params![story_id, attempt, Utc::now()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Close a log row with its outcome; duration is measured from `started_at`.
    pub fn log_run_finished(
        &self,
        id: i64,
        outcome: RunOutcome,
        error_message: Option<&str>,
    ) -> Result<()> {
        let started: DateTime<Utc> = self.conn.query_row(
            "SELECT started_at FROM execution_log WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        let now = Utc::now();
        let duration = (now - started).num_milliseconds() as f64 / 1000.0;
        self.conn.execute(
            "UPDATE execution_log SET status = ?1, finished_at = ?2, duration_seconds = ?3,
                 error_message = ?4
             WHERE id = ?5",
            params![outcome, now, duration, error_message, id],
        )?;
        Ok(())
    }

    pub fn execution_log_for(&self, story_id: &str) -> Result<Vec<ExecutionLogEntry>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM execution_log WHERE story_id = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![story_id], ExecutionLogEntry::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn metrics(&self) -> Result<Metrics> {
        let mut stmt = self.conn.prepare("SELECT * FROM execution_log ORDER BY id")?;
        let entries = stmt
            .query_map([], ExecutionLogEntry::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut metrics = Metrics {
            stories: Progress::of(&self.list_stories(None)?),
            ..Default::default()
        };
        for e in &entries {
            metrics.runs += 1;
            let failed = matches!(
                e.status,
                RunOutcome::Error | RunOutcome::Blocked | RunOutcome::Timeout
            );
            if e.status == RunOutcome::Complete {
                metrics.completed += 1;
            }
            if failed {
                metrics.failed += 1;
            }
            let duration = e.duration_seconds.unwrap_or(0.0);
            metrics.total_duration_seconds += duration;

            let idx = match metrics.per_story.iter().position(|s| s.story_id == e.story_id) {
                Some(i) => i,
                None => {
                    metrics.per_story.push(StoryMetrics {
                        story_id: e.story_id.clone(),
                        ..Default::default()
                    });
                    metrics.per_story.len() - 1
                }
            };
            let entry = &mut metrics.per_story[idx];
            entry.runs += 1;
            entry.duration_seconds += duration;
            if failed {
                entry.failures += 1;
            }
        }
        Ok(metrics)
    }
}
