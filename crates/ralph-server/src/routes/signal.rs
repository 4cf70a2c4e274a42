use axum::extract::{Query, State};
use axum::Json;
use ralph_core::signal::Signal;
use serde::Deserialize;

use crate::error::AppError;
use crate::extract::JsonBody;
use crate::state::{AppState, EventKind};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalQuery {
    #[serde(default, alias = "story_id")]
    pub story_id: Option<String>,
}

/// GET /api/signal: flags for one story, or the run state when no story is named.
pub async fn get_signal(
    State(app): State<AppState>,
    Query(query): Query<SignalQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let result = app
        .blocking(move |s| {
            let state = s.run_state()?;
            let Some(id) = query.story_id.filter(|id| !id.trim().is_empty()) else {
                return Ok(serde_json::to_value(&state)?);
            };
            let story = s.get_story(&id)?;
            Ok(serde_json::json!({
                "storyId": story.id,
                "status": story.status(state.current_story.as_deref()),
                "passes": story.passes,
                "merged": story.merged,
                "skipped": story.skipped,
                "prUrl": story.pr_url,
            }))
        })
        .await?;
    Ok(Json(result))
}

/// POST /api/signal: the agent reports `complete`, `blocked` or `progress`.
pub async fn post_signal(
    State(app): State<AppState>,
    JsonBody(body): JsonBody<serde_json::Value>,
) -> Result<Json<serde_json::Value>, AppError> {
    let signal = Signal::from_json(body)?;
    let action = signal.action();
    let outcome = app.blocking(move |s| s.apply_signal(&signal)).await?;

    if outcome.changed {
        app.emit(EventKind::StoryUpdate, &outcome.story);
        app.emit(EventKind::RunState, &outcome.run_state);
    } else {
        app.emit(
            EventKind::Log,
            serde_json::json!({ "storyId": outcome.story.id, "message": "progress" }),
        );
    }

    Ok(Json(serde_json::json!({
        "ok": true,
        "action": action,
        "changed": outcome.changed,
        "story": outcome.story,
        "state": outcome.run_state,
    })))
}
