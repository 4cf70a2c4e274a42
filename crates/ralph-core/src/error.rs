use crate::handoff::Handoff;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RalphError {
    #[error("not initialized: run 'ralph init'")]
    NotInitialized,

    #[error("version not found: {0}")]
    VersionNotFound(String),

    #[error("story not found: {0}")]
    StoryNotFound(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("handoff not found: {0}")]
    HandoffNotFound(i64),

    #[error("invalid {field}: {reason}")]
    InvalidField { field: String, reason: String },

    #[error(
        "invalid agent '{0}': expected one of orchestrator, analyst, implementer, reviewer, documenter"
    )]
    InvalidAgent(String),

    #[error("invalid action '{action}': expected one of {expected}")]
    InvalidAction { action: String, expected: String },

    #[error("invalid {kind} '{value}'")]
    InvalidStatus { kind: &'static str, value: String },

    #[error("invalid dependency reference '{0}'")]
    InvalidDependency(String),

    #[error("illegal handoff transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error(
        "a pending handoff to {} already exists for story {} (id {})",
        .0.to_agent, .0.story_id, .0.id
    )]
    HandoffConflict(Box<Handoff>),

    #[error("handoff {id} is {status}, not pending")]
    HandoffNotPending { id: i64, status: String },

    #[error("story {0} is merged and cannot be reopened")]
    MergedIsTerminal(String),

    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchema { found: i64, supported: i64 },

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl RalphError {
    pub fn invalid_field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        RalphError::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// True for errors caused by the caller's input rather than by storage or I/O.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            RalphError::InvalidField { .. }
                | RalphError::InvalidAgent(_)
                | RalphError::InvalidAction { .. }
                | RalphError::InvalidStatus { .. }
                | RalphError::InvalidDependency(_)
                | RalphError::InvalidTransition { .. }
                | RalphError::HandoffNotPending { .. }
                | RalphError::MergedIsTerminal(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RalphError::VersionNotFound(_)
                | RalphError::StoryNotFound(_)
                | RalphError::TaskNotFound(_)
                | RalphError::HandoffNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RalphError>;
