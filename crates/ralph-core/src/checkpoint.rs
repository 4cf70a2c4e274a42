use crate::db::Store;
use crate::error::Result;
use crate::types::CheckpointStage;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// Marker that a story finished a stage, used to resume after a crash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub story_id: String,
    pub stage: CheckpointStage,
    pub data: serde_json::Value,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Checkpoint {
            story_id: row.get("story_id")?,
            stage: row.get("stage")?,
            data: row.get("data")?,
            attempt: row.get("attempt")?,
            created_at: row.get("created_at")?,
        })
    }
}

impl Store {
    /// Save (or overwrite) the checkpoint for `(story_id, stage)`, stamped
    /// with the run's current attempt.
    pub fn save_checkpoint(
        &self,
        story_id: &str,
        stage: CheckpointStage,
        data: serde_json::Value,
    ) -> Result<Checkpoint> {
        let attempt = self.run_state()?.attempts.max(1);
        let now = Utc::now();
        self.conn.execute(
            "INSERT INTO checkpoints (story_id, stage, data, attempt, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (story_id, stage) DO UPDATE SET
                 data = excluded.data,
                 attempt = excluded.attempt,
                 created_at = excluded.created_at",
            params![story_id, stage, data, attempt, now],
        )?;
        tracing::debug!(story = story_id, stage = %stage, "checkpoint saved");
        Ok(Checkpoint {
            story_id: story_id.to_string(),
            stage,
            data,
            attempt,
            created_at: now,
        })
    }

    pub fn get_checkpoint(
        &self,
        story_id: &str,
        stage: CheckpointStage,
    ) -> Result<Option<Checkpoint>> {
        Ok(self
            .conn
            .query_row(
                "SELECT * FROM checkpoints WHERE story_id = ?1 AND stage = ?2",
                params![story_id, stage],
                Checkpoint::from_row,
            )
            .optional()?)
    }

    pub fn has_checkpoint(&self, story_id: &str, stage: CheckpointStage) -> Result<bool> {
        Ok(self.get_checkpoint(story_id, stage)?.is_some())
    }

    /// All checkpoints for a story, in stage order.
    pub fn checkpoints_for(&self, story_id: &str) -> Result<Vec<Checkpoint>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM checkpoints WHERE story_id = ?1")?;
        let mut checkpoints = stmt
            .query_map(params![story_id], Checkpoint::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        checkpoints.sort_by_key(|c| c.stage);
        Ok(checkpoints)
    }

    /// The furthest stage reached, if any.
    pub fn latest_checkpoint(&self, story_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.checkpoints_for(story_id)?.pop())
    }

    pub fn clear_checkpoints(&self, story_id: &str) -> Result<usize> {
        Ok(self.conn.execute(
            "DELETE FROM checkpoints WHERE story_id = ?1",
            params![story_id],
        )?)
    }

    /// Drop `stage` and every later stage so they run again.
    pub fn clear_checkpoints_from(&self, story_id: &str, stage: CheckpointStage) -> Result<usize> {
        let mut removed = 0;
        for s in CheckpointStage::all().iter().filter(|s| **s >= stage) {
            removed += self.conn.execute(
                "DELETE FROM checkpoints WHERE story_id = ?1 AND stage = ?2",
                params![story_id, s],
            )?;
        }
        Ok(removed)
    }
}
