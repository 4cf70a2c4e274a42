use axum::extract::{Query, State};
use axum::Json;
use ralph_core::types::Agent;
use ralph_core::RalphError;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::AppError;
use crate::extract::JsonBody;
use crate::state::{AppState, EventKind};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffQuery {
    #[serde(default)]
    pub story_id: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
}

/// GET /api/handoffs: `?storyId&agent` gives the pending handoff for that
/// agent (or null); `?storyId` alone gives the story's pipeline state.
pub async fn get_handoffs(
    State(app): State<AppState>,
    Query(query): Query<HandoffQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let story_id = query
        .story_id
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| AppError::bad_request("storyId", "is required"))?;
    let agent = query.agent.map(|a| a.parse::<Agent>()).transpose()?;

    let result = app
        .blocking(move |s| {
            let story = s.get_story(&story_id)?;
            match agent {
                Some(agent) => Ok(serde_json::to_value(s.pending_handoff(&story.id, agent)?)?),
                None => Ok(serde_json::to_value(s.handoff_state(&story.id)?)?),
            }
        })
        .await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateBody {
    story_id: String,
    from_agent: String,
    to_agent: String,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AcceptBody {
    handoff_id: i64,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RejectBody {
    handoff_id: i64,
    reason: String,
    /// Also create the handoff back to the sender, atomically.
    #[serde(default, rename = "return")]
    send_back: bool,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

/// A `POST /api/handoffs` body, dispatched on its `action` field.
#[derive(Debug)]
enum HandoffRequest {
    Create {
        story_id: String,
        from: Agent,
        to: Agent,
        payload: serde_json::Value,
    },
    Accept {
        id: i64,
        payload: Option<serde_json::Value>,
    },
    Reject {
        id: i64,
        reason: String,
        send_back: bool,
        payload: Option<serde_json::Value>,
    },
}

fn fields<T: DeserializeOwned>(body: serde_json::Value) -> Result<T, RalphError> {
    serde_json::from_value(body).map_err(|e| RalphError::invalid_field("body", e.to_string()))
}

impl HandoffRequest {
    fn from_json(body: serde_json::Value) -> Result<Self, RalphError> {
        let action = body
            .get("action")
            .and_then(|a| a.as_str())
            .ok_or_else(|| RalphError::invalid_field("action", "is required"))?
            .to_string();
        match action.as_str() {
            "create" => {
                let b: CreateBody = fields(body)?;
                Ok(HandoffRequest::Create {
                    story_id: b.story_id,
                    from: b.from_agent.parse()?,
                    to: b.to_agent.parse()?,
                    payload: b.payload.unwrap_or_else(|| serde_json::json!({})),
                })
            }
            "accept" => {
                let b: AcceptBody = fields(body)?;
                Ok(HandoffRequest::Accept {
                    id: b.handoff_id,
                    payload: b.payload,
                })
            }
            "reject" => {
                let b: RejectBody = fields(body)?;
                if b.reason.trim().is_empty() {
                    return Err(RalphError::invalid_field("reason", "is required"));
                }
                Ok(HandoffRequest::Reject {
                    id: b.handoff_id,
                    reason: b.reason,
                    send_back: b.send_back,
                    payload: b.payload,
                })
            }
            other => Err(RalphError::InvalidAction {
                action: other.to_string(),
                expected: "create, accept, reject".into(),
            }),
        }
    }
}

/// POST /api/handoffs: create, accept or reject a handoff.
pub async fn post_handoffs(
    State(app): State<AppState>,
    JsonBody(body): JsonBody<serde_json::Value>,
) -> Result<Json<serde_json::Value>, AppError> {
    let request = HandoffRequest::from_json(body)?;
    let result = app
        .blocking(move |s| match request {
            HandoffRequest::Create {
                story_id,
                from,
                to,
                payload,
            } => {
                let story = s.get_story(&story_id)?;
                let handoff = s.create_handoff(&story.id, from, to, payload)?;
                Ok(serde_json::json!({ "handoff": handoff }))
            }
            HandoffRequest::Accept { id, payload } => {
                let handoff = s.accept_handoff(id, payload)?;
                Ok(serde_json::json!({ "handoff": handoff }))
            }
            HandoffRequest::Reject {
                id,
                reason,
                send_back: true,
                payload,
            } => {
                let (rejected, returned) = s.reject_and_return(id, &reason, payload)?;
                Ok(serde_json::json!({ "handoff": rejected, "returned": returned }))
            }
            HandoffRequest::Reject { id, reason, .. } => {
                let handoff = s.reject_handoff(id, &reason)?;
                Ok(serde_json::json!({ "handoff": handoff }))
            }
        })
        .await?;

    app.emit(EventKind::Handoff, &result);
    Ok(Json(result))
}
