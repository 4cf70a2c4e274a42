use crate::db::Store;
use crate::error::{RalphError, Result};
use crate::types::{Agent, HandoffStatus};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// A recorded transfer of a story between two agent roles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handoff {
    pub id: i64,
    pub story_id: String,
    pub from_agent: Agent,
    pub to_agent: Agent,
    pub status: HandoffStatus,
    pub payload: serde_json::Value,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Handoff {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Handoff {
            id: row.get("id")?,
            story_id: row.get("story_id")?,
            from_agent: row.get("from_agent")?,
            to_agent: row.get("to_agent")?,
            status: row.get("status")?,
            payload: row.get("payload")?,
            rejection_reason: row.get("rejection_reason")?,
            created_at: row.get("created_at")?,
            processed_at: row.get("processed_at")?,
        })
    }
}

/// Where a story sits in the agent pipeline, derived from its handoffs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    Idle,
    Analyzing,
    Implementing,
    Reviewing,
    Documenting,
    Complete,
}

impl PipelinePhase {
    fn for_agent(agent: Agent) -> Self {
        match agent {
            Agent::Orchestrator => PipelinePhase::Idle,
            Agent::Analyst => PipelinePhase::Analyzing,
            Agent::Implementer => PipelinePhase::Implementing,
            Agent::Reviewer => PipelinePhase::Reviewing,
            Agent::Documenter => PipelinePhase::Documenting,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PipelinePhase::Idle => "idle",
            PipelinePhase::Analyzing => "analyzing",
            PipelinePhase::Implementing => "implementing",
            PipelinePhase::Reviewing => "reviewing",
            PipelinePhase::Documenting => "documenting",
            PipelinePhase::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffState {
    pub story_id: String,
    pub current_agent: Agent,
    pub phase: PipelinePhase,
    pub pending: Option<Handoff>,
    pub handoffs: Vec<Handoff>,
}

/// Merge `extra` into `base` when both are objects; otherwise `extra` wins.
fn merge_payload(base: &mut serde_json::Value, extra: serde_json::Value) {
    match extra {
        serde_json::Value::Null => {}
        serde_json::Value::Object(more) if base.is_object() => {
            if let Some(obj) = base.as_object_mut() {
                obj.extend(more);
            }
        }
        other => *base = other,
    }
}

fn fetch(conn: &Connection, id: i64) -> Result<Handoff> {
    conn.query_row(
        "SELECT * FROM handoffs WHERE id = ?1",
        params![id],
        Handoff::from_row,
    )
    .optional()?
    .ok_or(RalphError::HandoffNotFound(id))
}

fn pending(conn: &Connection, story_id: &str, to: Agent) -> Result<Option<Handoff>> {
    Ok(conn
        .query_row(
            "SELECT * FROM handoffs
             WHERE story_id = ?1 AND to_agent = ?2 AND status = 'pending'
             ORDER BY id DESC LIMIT 1",
            params![story_id, to],
            Handoff::from_row,
        )
        .optional()?)
}

/// Validate and insert a pending handoff on `conn`.
fn insert(
    conn: &Connection,
    story_id: &str,
    from: Agent,
    to: Agent,
    payload: &serde_json::Value,
    now: DateTime<Utc>,
) -> Result<Handoff> {
    if !from.can_hand_off_to(to) {
        return Err(RalphError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        });
    }
    if let Some(existing) = pending(conn, story_id, to)? {
        return Err(RalphError::HandoffConflict(Box::new(existing)));
    }
    conn.execute(
        "INSERT INTO handoffs (story_id, from_agent, to_agent, status, payload, created_at)
         VALUES (?1, ?2, ?3, 'pending', ?4, ?5)",
        params![story_id, from, to, payload, now],
    )?;
    fetch(conn, conn.last_insert_rowid())
}

fn require_pending(h: &Handoff) -> Result<()> {
    if h.status.is_terminal() {
        return Err(RalphError::HandoffNotPending {
            id: h.id,
            status: h.status.to_string(),
        });
    }
    Ok(())
}

impl Store {
    /// Record a handoff from `from` to `to`. Fails on an illegal transition,
    /// or with [`RalphError::HandoffConflict`] when `to` already has a pending
    /// handoff for this story.
    pub fn create_handoff(
        &self,
        story_id: &str,
        from: Agent,
        to: Agent,
        payload: serde_json::Value,
    ) -> Result<Handoff> {
        let handoff = insert(&self.conn, story_id, from, to, &payload, Utc::now())?;
        tracing::info!(story = story_id, %from, %to, id = handoff.id, "handoff created");
        Ok(handoff)
    }

    pub fn get_handoff(&self, id: i64) -> Result<Handoff> {
        fetch(&self.conn, id)
    }

    /// The pending handoff addressed to `agent` for a story, if any.
    pub fn pending_handoff(&self, story_id: &str, agent: Agent) -> Result<Option<Handoff>> {
        pending(&self.conn, story_id, agent)
    }

    /// Every handoff for a story, oldest first.
    pub fn handoffs_for(&self, story_id: &str) -> Result<Vec<Handoff>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM handoffs WHERE story_id = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![story_id], Handoff::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Accept a pending handoff, merging `payload` into the stored one.
    pub fn accept_handoff(&self, id: i64, payload: Option<serde_json::Value>) -> Result<Handoff> {
        let mut handoff = fetch(&self.conn, id)?;
        require_pending(&handoff)?;
        if let Some(extra) = payload {
            merge_payload(&mut handoff.payload, extra);
        }
        self.conn.execute(
            "UPDATE handoffs SET status = 'accepted', payload = ?1, processed_at = ?2 WHERE id = ?3",
            params![handoff.payload, Utc::now(), id],
        )?;
        tracing::info!(id, story = %handoff.story_id, "handoff accepted");
        fetch(&self.conn, id)
    }

    /// Mark a pending handoff rejected. The return handoff is not created;
    /// see [`Store::reject_and_return`].
    pub fn reject_handoff(&self, id: i64, reason: &str) -> Result<Handoff> {
        let handoff = fetch(&self.conn, id)?;
        require_pending(&handoff)?;
        self.conn.execute(
            "UPDATE handoffs SET status = 'rejected', rejection_reason = ?1, processed_at = ?2
             WHERE id = ?3",
            params![reason, Utc::now(), id],
        )?;
        tracing::info!(id, story = %handoff.story_id, "handoff rejected: {reason}");
        fetch(&self.conn, id)
    }

    /// Reject a handoff and send the work back to the agent that sent it,
    /// in one transaction. The return handoff carries the original payload
    /// plus `rejection_reason` and `rejected_by`. If the return edge is not a
    /// legal transition nothing is changed.
    pub fn reject_and_return(
        &self,
        id: i64,
        reason: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<(Handoff, Handoff)> {
        let tx = self.conn.unchecked_transaction()?;
        let original = fetch(&tx, id)?;
        require_pending(&original)?;
        let now = Utc::now();
        tx.execute(
            "UPDATE handoffs SET status = 'rejected', rejection_reason = ?1, processed_at = ?2
             WHERE id = ?3",
            params![reason, now, id],
        )?;

        let mut back = original.payload.clone();
        if let Some(extra) = payload {
            merge_payload(&mut back, extra);
        }
        merge_payload(
            &mut back,
            serde_json::json!({
                "rejection_reason": reason,
                "rejected_by": original.to_agent,
                "rejected_handoff_id": id,
            }),
        );
        let returned = insert(
            &tx,
            &original.story_id,
            original.to_agent,
            original.from_agent,
            &back,
            now,
        )?;
        let rejected = fetch(&tx, id)?;
        tx.commit()?;
        tracing::info!(
            id,
            story = %original.story_id,
            returned = returned.id,
            "handoff rejected and returned to {}",
            original.from_agent
        );
        Ok((rejected, returned))
    }

    /// Pending handoffs created more than `minutes` ago.
    pub fn find_stale_handoffs(&self, minutes: i64) -> Result<Vec<Handoff>> {
        self.find_stale_handoffs_at(minutes, Utc::now())
    }

    pub fn find_stale_handoffs_at(&self, minutes: i64, now: DateTime<Utc>) -> Result<Vec<Handoff>> {
        let cutoff = now - Duration::minutes(minutes);
        let mut stmt = self.conn.prepare(
            "SELECT * FROM handoffs WHERE status = 'pending' AND created_at < ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![cutoff], Handoff::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn timeout_handoff(&self, id: i64, reason: &str) -> Result<Handoff> {
        let handoff = fetch(&self.conn, id)?;
        require_pending(&handoff)?;
        self.conn.execute(
            "UPDATE handoffs SET status = 'timeout', rejection_reason = ?1, processed_at = ?2
             WHERE id = ?3",
            params![reason, Utc::now(), id],
        )?;
        tracing::warn!(id, story = %handoff.story_id, "handoff timed out: {reason}");
        fetch(&self.conn, id)
    }

    /// Time out every handoff pending longer than `minutes`. Returns the
    /// handoffs that were swept.
    pub fn sweep_stale_handoffs(&self, minutes: i64) -> Result<Vec<Handoff>> {
        let reason = format!("no response within {minutes} minutes");
        self.find_stale_handoffs(minutes)?
            .into_iter()
            .map(|h| self.timeout_handoff(h.id, &reason))
            .collect()
    }

    /// Derive the pipeline position of a story: the target of the most recent
    /// pending handoff, otherwise the orchestrator.
    pub fn handoff_state(&self, story_id: &str) -> Result<HandoffState> {
        let handoffs = self.handoffs_for(story_id)?;
        let pending = handoffs
            .iter()
            .rev()
            .find(|h| h.status == HandoffStatus::Pending)
            .cloned();

        let (current_agent, phase) = match &pending {
            Some(h) => (h.to_agent, PipelinePhase::for_agent(h.to_agent)),
            None => {
                let finished = handoffs.last().is_some_and(|h| {
                    h.status == HandoffStatus::Accepted && h.to_agent == Agent::Orchestrator
                });
                let phase = if finished {
                    PipelinePhase::Complete
                } else {
                    PipelinePhase::Idle
                };
                (Agent::Orchestrator, phase)
            }
        };

        Ok(HandoffState {
            story_id: story_id.to_string(),
            current_agent,
            phase,
            pending,
            handoffs,
        })
    }
}
