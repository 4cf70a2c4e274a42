use crate::db::Store;
use crate::error::{RalphError, Result};
use crate::types::RunStatus;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// The single row describing what the orchestrator is doing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub current_story: Option<String>,
    pub status: RunStatus,
    pub attempts: u32,
    pub last_completed: Option<String>,
    pub last_error: Option<String>,
    pub failure_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl RunState {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(RunState {
            current_story: row.get("current_story")?,
            status: row.get("status")?,
            attempts: row.get("attempts")?,
            last_completed: row.get("last_completed")?,
            last_error: row.get("last_error")?,
            failure_count: row.get("failure_count")?,
            started_at: row.get("started_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

impl Store {
    pub fn run_state(&self) -> Result<RunState> {
        let state = self
            .conn
            .query_row("SELECT * FROM run_state WHERE id = 1", [], RunState::from_row)
            .optional()?;
        state.ok_or(RalphError::NotInitialized)
    }

    /// Begin work on a story: it becomes current, status `running`, attempt 1,
    /// and the branch is recorded on the story.
    pub fn start_story(&self, story_id: &str, branch: &str) -> Result<RunState> {
        let story_id = self.get_story(story_id)?.id;
        let story_id = story_id.as_str();
        let tx = self.conn.unchecked_transaction()?;
        let now = Utc::now();
        tx.execute(
            "UPDATE stories SET working_branch = ?1, updated_at = ?2 WHERE id = ?3",
            params![branch, now, story_id],
        )?;
        tx.execute(
            "UPDATE run_state SET current_story = ?1, status = ?2, attempts = 1,
                 last_error = NULL, started_at = ?3, updated_at = ?3
             WHERE id = 1",
            params![story_id, RunStatus::Running, now],
        )?;
        tx.commit()?;
        tracing::info!(story = story_id, branch, "story started");
        self.run_state()
    }

    /// Finish the current story: the run returns to idle, failure tracking is
    /// cleared and the story's checkpoints are dropped.
    pub fn complete_story(&self, story_id: &str, pr_url: Option<&str>) -> Result<RunState> {
        let story_id = self.story_key(story_id)?;
        let story_id = story_id.as_str();
        let tx = self.conn.unchecked_transaction()?;
        let now = Utc::now();
        if let Some(url) = pr_url {
            let updated = tx.execute(
                "UPDATE stories SET pr_url = ?1, updated_at = ?2 WHERE id = ?3",
                params![url, now, story_id],
            )?;
            if updated == 0 {
                return Err(RalphError::StoryNotFound(story_id.to_string()));
            }
        }
        tx.execute(
            "UPDATE run_state SET current_story = NULL, status = ?1, attempts = 0,
                 last_completed = ?2, last_error = NULL, failure_count = 0,
                 started_at = NULL, updated_at = ?3
             WHERE id = 1",
            params![RunStatus::Idle, story_id, now],
        )?;
        tx.execute(
            "DELETE FROM checkpoints WHERE story_id = ?1",
            params![story_id],
        )?;
        tx.commit()?;
        tracing::info!(story = story_id, "story completed");
        self.run_state()
    }

    /// Record a failure and return the length of the current streak. The
    /// count grows while the message repeats the previous one (surrounding
    /// whitespace aside) and restarts at 1 when it differs.
    pub fn record_failure(&self, message: &str) -> Result<u32> {
        let state = self.run_state()?;
        let same = state
            .last_error
            .as_deref()
            .is_some_and(|prev| prev.trim() == message.trim());
        let count = if same { state.failure_count + 1 } else { 1 };
        self.conn.execute(
            "UPDATE run_state SET last_error = ?1, failure_count = ?2, updated_at = ?3 WHERE id = 1",
            params![message, count, Utc::now()],
        )?;
        tracing::warn!(failure_count = count, "run failure: {message}");
        Ok(count)
    }

    pub fn clear_failure(&self) -> Result<()> {
        self.conn.execute(
            "UPDATE run_state SET last_error = NULL, failure_count = 0, updated_at = ?1 WHERE id = 1",
            params![Utc::now()],
        )?;
        Ok(())
    }

    /// Bump the attempt counter and return the new value.
    pub fn increment_attempt(&self) -> Result<u32> {
        self.conn.execute(
            "UPDATE run_state SET attempts = attempts + 1, updated_at = ?1 WHERE id = 1",
            params![Utc::now()],
        )?;
        Ok(self.run_state()?.attempts)
    }

    /// Restore defaults, keeping `last_completed`.
    pub fn reset_state(&self) -> Result<RunState> {
        self.conn.execute(
            "UPDATE run_state SET current_story = NULL, status = ?1, attempts = 0,
                 last_error = NULL, failure_count = 0, started_at = NULL, updated_at = ?2
             WHERE id = 1",
            params![RunStatus::Idle, Utc::now()],
        )?;
        tracing::info!("run state reset");
        self.run_state()
    }

    /// Change the run status. Statuses that do not hold a story clear
    /// `current_story`; statuses that do require one to be set already.
    pub fn set_status(&self, status: RunStatus) -> Result<RunState> {
        let state = self.run_state()?;
        if status.holds_story() {
            if state.current_story.is_none() {
                return Err(RalphError::invalid_field(
                    "status",
                    format!("'{status}' requires a current story"),
                ));
            }
            self.conn.execute(
                "UPDATE run_state SET status = ?1, updated_at = ?2 WHERE id = 1",
                params![status, Utc::now()],
            )?;
        } else {
            self.conn.execute(
                "UPDATE run_state SET status = ?1, current_story = NULL, updated_at = ?2 WHERE id = 1",
                params![status, Utc::now()],
            )?;
        }
        self.run_state()
    }

    /// Put the run into a story-holding status for `story_id` (used for gates
    /// raised before the story is started).
    pub fn hold_story(&self, story_id: &str, status: RunStatus) -> Result<RunState> {
        if !status.holds_story() {
            return Err(RalphError::invalid_field(
                "status",
                format!("'{status}' does not hold a story"),
            ));
        }
        let story_id = self.story_key(story_id)?;
        self.conn.execute(
            "UPDATE run_state SET current_story = ?1, status = ?2, updated_at = ?3 WHERE id = 1",
            params![story_id, status, Utc::now()],
        )?;
        self.run_state()
    }

    /// Record `message` as a failure and mark the run blocked on `story_id`
    /// without ending the attempt.
    pub fn block_story(&self, story_id: &str, message: &str) -> Result<RunState> {
        let key = self.story_key(story_id)?;
        self.record_failure(message)?;
        self.conn.execute(
            "UPDATE run_state SET status = ?1, current_story = COALESCE(current_story, ?2),
                 updated_at = ?3
             WHERE id = 1",
            params![RunStatus::Blocked, key, Utc::now()],
        )?;
        tracing::warn!(story = story_id, "run blocked: {message}");
        self.run_state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prd::tests::seed_prd;
    use crate::types::CheckpointStage;

    #[test]
    fn fresh_store_is_idle() {
        let store = Store::open_in_memory().unwrap();
        let state = store.run_state().unwrap();
        assert_eq!(state.status, RunStatus::Idle);
        assert_eq!(state.current_story, None);
        assert_eq!(state.attempts, 0);
        assert_eq!(state.failure_count, 0);
    }

    #[test]
    fn start_then_complete_round_trip() {
        let store = Store::open_in_memory().unwrap();
        seed_prd(&store);

        let state = store.start_story("1.2.3", "feat/x").unwrap();
        assert_eq!(state.current_story.as_deref(), Some("v0.1:1.2.3"));
        assert_eq!(state.status, RunStatus::Running);
        assert_eq!(state.attempts, 1);
        assert_eq!(
            store.get_story("1.2.3").unwrap().working_branch.as_deref(),
            Some("feat/x")
        );

        store
            .save_checkpoint("v0.1:1.2.3", CheckpointStage::BranchCreated, serde_json::json!({}))
            .unwrap();

        let state = store.complete_story("1.2.3", Some("https://pr/7")).unwrap();
        assert_eq!(state.current_story, None);
        assert_eq!(state.status, RunStatus::Idle);
        assert_eq!(state.last_completed.as_deref(), Some("v0.1:1.2.3"));
        assert_eq!(state.attempts, 0);
        assert_eq!(
            store.get_story("1.2.3").unwrap().pr_url.as_deref(),
            Some("https://pr/7")
        );
        assert!(store.checkpoints_for("v0.1:1.2.3").unwrap().is_empty());
    }

    #[test]
    fn start_unknown_story_fails() {
        let store = Store::open_in_memory().unwrap();
        let err = store.start_story("9.9.9", "feat/none").unwrap_err();
        assert!(matches!(err, RalphError::StoryNotFound(_)));
        assert_eq!(store.run_state().unwrap().status, RunStatus::Idle);
    }

    #[test]
    fn failure_streak_counts_repeats_and_resets_on_change() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.record_failure("missing API key").unwrap(), 1);
        assert_eq!(store.record_failure("missing API key").unwrap(), 2);
        assert_eq!(store.record_failure("  missing API key\n").unwrap(), 3);
        assert_eq!(store.record_failure("tests failed").unwrap(), 1);
        assert_eq!(
            store.run_state().unwrap().last_error.as_deref(),
            Some("tests failed")
        );
    }

    #[test]
    fn failures_differing_only_in_numbers_are_distinct() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.record_failure("agent exited with code 1").unwrap(), 1);
        assert_eq!(store.record_failure("agent exited with code 137").unwrap(), 1);
        assert_eq!(store.run_state().unwrap().failure_count, 1);
        assert_eq!(store.record_failure("Agent exited with code 137").unwrap(), 1);
    }

    #[test]
    fn increment_attempt_returns_new_count() {
        let store = Store::open_in_memory().unwrap();
        seed_prd(&store);
        store.start_story("1.1.1", "feat/a").unwrap();
        assert_eq!(store.increment_attempt().unwrap(), 2);
        assert_eq!(store.increment_attempt().unwrap(), 3);
    }

    #[test]
    fn reset_preserves_last_completed() {
        let store = Store::open_in_memory().unwrap();
        seed_prd(&store);
        store.start_story("1.1.1", "feat/a").unwrap();
        store.complete_story("1.1.1", None).unwrap();
        store.start_story("1.1.2", "feat/b").unwrap();
        store.record_failure("boom").unwrap();

        let state = store.reset_state().unwrap();
        assert_eq!(state.status, RunStatus::Idle);
        assert_eq!(state.current_story, None);
        assert_eq!(state.failure_count, 0);
        assert_eq!(state.last_error, None);
        assert_eq!(state.last_completed.as_deref(), Some("v0.1:1.1.1"));
    }

    #[test]
    fn idle_clears_current_story() {
        let store = Store::open_in_memory().unwrap();
        seed_prd(&store);
        store.start_story("1.1.1", "feat/a").unwrap();
        let state = store.set_status(RunStatus::Idle).unwrap();
        assert_eq!(state.current_story, None);
    }

    #[test]
    fn holding_status_requires_story() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.set_status(RunStatus::Blocked).is_err());
        assert!(store.hold_story("1.1.1", RunStatus::Idle).is_err());
        let state = store.hold_story("1.1.1", RunStatus::WaitingGate).unwrap();
        assert_eq!(state.current_story.as_deref(), Some("1.1.1"));
    }

    #[test]
    fn block_keeps_existing_current_story() {
        let store = Store::open_in_memory().unwrap();
        seed_prd(&store);
        store.start_story("1.1.1", "feat/a").unwrap();
        let state = store.block_story("1.1.2", "stuck").unwrap();
        assert_eq!(state.status, RunStatus::Blocked);
        assert_eq!(state.current_story.as_deref(), Some("v0.1:1.1.1"));
        assert_eq!(state.attempts, 1);
    }
}
