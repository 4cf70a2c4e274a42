use crate::db::Store;
use crate::error::{RalphError, Result};
use crate::run_state::RunState;
use crate::story::Story;
use crate::types::CheckpointStage;
use serde::{Deserialize, Serialize};

pub const SIGNAL_ACTIONS: &str = "complete, blocked, progress";

/// A status report from the external agent about the story it is working on.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Signal {
    Complete {
        story_id: String,
        message: Option<String>,
        pr_url: Option<String>,
    },
    Blocked {
        story_id: String,
        message: Option<String>,
    },
    Progress {
        story_id: String,
        message: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSignal {
    #[serde(default, alias = "story_id")]
    story_id: Option<String>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default, alias = "pr_url")]
    pr_url: Option<String>,
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|v| !v.trim().is_empty())
}

impl Signal {
    /// Validate a JSON body into a signal. Missing `storyId` or `action` and
    /// unknown actions are validation errors.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let raw: RawSignal = serde_json::from_value(value)
            .map_err(|e| RalphError::invalid_field("body", e.to_string()))?;
        let story_id = non_empty(raw.story_id)
            .ok_or_else(|| RalphError::invalid_field("storyId", "is required"))?;
        let action =
            non_empty(raw.action).ok_or_else(|| RalphError::invalid_field("action", "is required"))?;
        Self::build(&action, story_id, raw.message, raw.pr_url)
    }

    pub fn build(
        action: &str,
        story_id: String,
        message: Option<String>,
        pr_url: Option<String>,
    ) -> Result<Self> {
        let message = non_empty(message);
        match action {
            "complete" => Ok(Signal::Complete {
                story_id,
                message,
                pr_url: non_empty(pr_url),
            }),
            "blocked" => Ok(Signal::Blocked { story_id, message }),
            "progress" => Ok(Signal::Progress { story_id, message }),
            other => Err(RalphError::InvalidAction {
                action: other.to_string(),
                expected: SIGNAL_ACTIONS.into(),
            }),
        }
    }

    pub fn story_id(&self) -> &str {
        match self {
            Signal::Complete { story_id, .. }
            | Signal::Blocked { story_id, .. }
            | Signal::Progress { story_id, .. } => story_id,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Signal::Complete { .. } => "complete",
            Signal::Blocked { .. } => "blocked",
            Signal::Progress { .. } => "progress",
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Signal::Complete { message, .. }
            | Signal::Blocked { message, .. }
            | Signal::Progress { message, .. } => message.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SignalOutcome {
    pub story: Story,
    pub run_state: RunState,
    /// False for `progress`, which never mutates state.
    pub changed: bool,
}

impl Store {
    pub fn apply_signal(&self, signal: &Signal) -> Result<SignalOutcome> {
        let story = self.get_story(signal.story_id())?;
        match signal {
            Signal::Complete {
                message, pr_url, ..
            } => {
                self.mark_passed(&story.id)?;
                if let Some(url) = pr_url {
                    self.set_pr_url(&story.id, url)?;
                }
                self.save_checkpoint(
                    &story.id,
                    CheckpointStage::ClaudeComplete,
                    serde_json::json!({ "message": message, "prUrl": pr_url, "source": "signal" }),
                )?;
                self.clear_failure()?;
                tracing::info!(story = %story.id, "agent signalled complete");
                Ok(SignalOutcome {
                    story: self.get_story(&story.id)?,
                    run_state: self.run_state()?,
                    changed: true,
                })
            }
            Signal::Blocked { message, .. } => {
                let message = message.as_deref().unwrap_or("Story blocked");
                let run_state = self.block_story(&story.id, message)?;
                Ok(SignalOutcome {
                    story,
                    run_state,
                    changed: true,
                })
            }
            Signal::Progress { message, .. } => {
                tracing::debug!(
                    story = %story.id,
                    "agent progress: {}",
                    message.as_deref().unwrap_or("")
                );
                Ok(SignalOutcome {
                    story,
                    run_state: self.run_state()?,
                    changed: false,
                })
            }
        }
    }
}
