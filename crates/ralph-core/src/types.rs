use crate::error::RalphError;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Implements `Display`, `ToSql` and `FromSql` for enums that carry
/// `as_str()` and a `FromStr` returning [`RalphError`].
macro_rules! text_enum {
    ($($ty:ty),* $(,)?) => {$(
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: RalphError| FromSqlError::Other(Box::new(e)))
            }
        }
    )*};
}

// ---------------------------------------------------------------------------
// RunStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Paused,
    WaitingGate,
    Blocked,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::WaitingGate => "waiting_gate",
            RunStatus::Blocked => "blocked",
        }
    }

    /// Statuses in which the run owns a current story.
    pub fn holds_story(self) -> bool {
        matches!(
            self,
            RunStatus::Running | RunStatus::WaitingGate | RunStatus::Blocked
        )
    }
}

impl std::str::FromStr for RunStatus {
    type Err = RalphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(RunStatus::Idle),
            "running" => Ok(RunStatus::Running),
            "paused" => Ok(RunStatus::Paused),
            "waiting_gate" => Ok(RunStatus::WaitingGate),
            "blocked" => Ok(RunStatus::Blocked),
            _ => Err(RalphError::InvalidStatus {
                kind: "run status",
                value: s.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// CheckpointStage
// ---------------------------------------------------------------------------

/// Stages a story passes through during one execution, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStage {
    ExternalDepsComplete,
    ValidationComplete,
    BranchCreated,
    ClaudeStarted,
    ClaudeComplete,
    PrCreated,
}

impl CheckpointStage {
    pub fn all() -> &'static [CheckpointStage] {
        &[
            CheckpointStage::ExternalDepsComplete,
            CheckpointStage::ValidationComplete,
            CheckpointStage::BranchCreated,
            CheckpointStage::ClaudeStarted,
            CheckpointStage::ClaudeComplete,
            CheckpointStage::PrCreated,
        ]
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn next(self) -> Option<CheckpointStage> {
        CheckpointStage::all().get(self.index() + 1).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CheckpointStage::ExternalDepsComplete => "external_deps_complete",
            CheckpointStage::ValidationComplete => "validation_complete",
            CheckpointStage::BranchCreated => "branch_created",
            CheckpointStage::ClaudeStarted => "claude_started",
            CheckpointStage::ClaudeComplete => "claude_complete",
            CheckpointStage::PrCreated => "pr_created",
        }
    }
}

impl std::str::FromStr for CheckpointStage {
    type Err = RalphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CheckpointStage::all()
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| RalphError::InvalidStatus {
                kind: "checkpoint stage",
                value: s.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Agent {
    Orchestrator,
    Analyst,
    Implementer,
    Reviewer,
    Documenter,
}

impl Agent {
    pub fn all() -> &'static [Agent] {
        &[
            Agent::Orchestrator,
            Agent::Analyst,
            Agent::Implementer,
            Agent::Reviewer,
            Agent::Documenter,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Agent::Orchestrator => "orchestrator",
            Agent::Analyst => "analyst",
            Agent::Implementer => "implementer",
            Agent::Reviewer => "reviewer",
            Agent::Documenter => "documenter",
        }
    }

    /// Agents this one may hand work to. `Reviewer -> Implementer` is the
    /// rejection path.
    pub fn successors(self) -> &'static [Agent] {
        match self {
            Agent::Orchestrator => &[Agent::Analyst],
            Agent::Analyst => &[Agent::Implementer],
            Agent::Implementer => &[Agent::Reviewer],
            Agent::Reviewer => &[Agent::Documenter, Agent::Implementer],
            Agent::Documenter => &[Agent::Orchestrator],
        }
    }

    pub fn can_hand_off_to(self, to: Agent) -> bool {
        self.successors().contains(&to)
    }
}

impl std::str::FromStr for Agent {
    type Err = RalphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "orchestrator" => Ok(Agent::Orchestrator),
            "analyst" => Ok(Agent::Analyst),
            "implementer" => Ok(Agent::Implementer),
            "reviewer" => Ok(Agent::Reviewer),
            "documenter" => Ok(Agent::Documenter),
            _ => Err(RalphError::InvalidAgent(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// HandoffStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffStatus {
    Pending,
    Accepted,
    Rejected,
    Timeout,
}

impl HandoffStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HandoffStatus::Pending => "pending",
            HandoffStatus::Accepted => "accepted",
            HandoffStatus::Rejected => "rejected",
            HandoffStatus::Timeout => "timeout",
        }
    }

    pub fn is_terminal(self) -> bool {
        self != HandoffStatus::Pending
    }
}

impl std::str::FromStr for HandoffStatus {
    type Err = RalphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(HandoffStatus::Pending),
            "accepted" => Ok(HandoffStatus::Accepted),
            "rejected" => Ok(HandoffStatus::Rejected),
            "timeout" => Ok(HandoffStatus::Timeout),
            _ => Err(RalphError::InvalidStatus {
                kind: "handoff status",
                value: s.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// StoryStatus
// ---------------------------------------------------------------------------

/// Derived from a story's flags on read; never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Pending,
    InProgress,
    Passed,
    Merged,
    Skipped,
}

impl StoryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StoryStatus::Pending => "pending",
            StoryStatus::InProgress => "in_progress",
            StoryStatus::Passed => "passed",
            StoryStatus::Merged => "merged",
            StoryStatus::Skipped => "skipped",
        }
    }
}

impl std::str::FromStr for StoryStatus {
    type Err = RalphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StoryStatus::Pending),
            "in_progress" => Ok(StoryStatus::InProgress),
            "passed" => Ok(StoryStatus::Passed),
            "merged" => Ok(StoryStatus::Merged),
            "skipped" => Ok(StoryStatus::Skipped),
            _ => Err(RalphError::InvalidStatus {
                kind: "story status",
                value: s.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskKind / TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    Refine,
    Generate,
    StoryEdit,
    Align,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Refine => "refine",
            TaskKind::Generate => "generate",
            TaskKind::StoryEdit => "story-edit",
            TaskKind::Align => "align",
        }
    }
}

impl std::str::FromStr for TaskKind {
    type Err = RalphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "refine" => Ok(TaskKind::Refine),
            "generate" => Ok(TaskKind::Generate),
            "story-edit" => Ok(TaskKind::StoryEdit),
            "align" => Ok(TaskKind::Align),
            _ => Err(RalphError::InvalidStatus {
                kind: "task type",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Complete,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Complete => "complete",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Failed)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = RalphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "running" => Ok(TaskStatus::Running),
            "complete" => Ok(TaskStatus::Complete),
            "failed" => Ok(TaskStatus::Failed),
            _ => Err(RalphError::InvalidStatus {
                kind: "task status",
                value: s.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// RunOutcome (execution log)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Running,
    Complete,
    Error,
    Blocked,
    Timeout,
}

impl RunOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RunOutcome::Running => "running",
            RunOutcome::Complete => "complete",
            RunOutcome::Error => "error",
            RunOutcome::Blocked => "blocked",
            RunOutcome::Timeout => "timeout",
        }
    }
}

impl std::str::FromStr for RunOutcome {
    type Err = RalphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunOutcome::Running),
            "complete" => Ok(RunOutcome::Complete),
            "error" => Ok(RunOutcome::Error),
            "blocked" => Ok(RunOutcome::Blocked),
            "timeout" => Ok(RunOutcome::Timeout),
            _ => Err(RalphError::InvalidStatus {
                kind: "run outcome",
                value: s.to_string(),
            }),
        }
    }
}

text_enum!(
    RunStatus,
    CheckpointStage,
    Agent,
    HandoffStatus,
    StoryStatus,
    TaskKind,
    TaskStatus,
    RunOutcome,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_stages_are_ordered() {
        assert!(CheckpointStage::ExternalDepsComplete < CheckpointStage::PrCreated);
        assert_eq!(
            CheckpointStage::BranchCreated.next(),
            Some(CheckpointStage::ClaudeStarted)
        );
        assert_eq!(CheckpointStage::PrCreated.next(), None);
    }

    #[test]
    fn agent_transition_table() {
        assert!(Agent::Orchestrator.can_hand_off_to(Agent::Analyst));
        assert!(Agent::Reviewer.can_hand_off_to(Agent::Implementer));
        assert!(Agent::Documenter.can_hand_off_to(Agent::Orchestrator));
        assert!(!Agent::Analyst.can_hand_off_to(Agent::Documenter));
        assert!(!Agent::Implementer.can_hand_off_to(Agent::Analyst));
    }

    #[test]
    fn unknown_agent_is_rejected() {
        let err = "qa".parse::<Agent>().unwrap_err();
        assert!(matches!(err, RalphError::InvalidAgent(ref a) if a == "qa"));
    }

    #[test]
    fn task_kind_uses_kebab_case() {
        assert_eq!(TaskKind::StoryEdit.as_str(), "story-edit");
        assert_eq!("story-edit".parse::<TaskKind>().unwrap(), TaskKind::StoryEdit);
        assert_eq!(
            serde_json::to_string(&TaskKind::StoryEdit).unwrap(),
            "\"story-edit\""
        );
    }

    #[test]
    fn run_status_holds_story() {
        assert!(RunStatus::Running.holds_story());
        assert!(RunStatus::WaitingGate.holds_story());
        assert!(RunStatus::Blocked.holds_story());
        assert!(!RunStatus::Idle.holds_story());
        assert!(!RunStatus::Paused.holds_story());
    }
}
