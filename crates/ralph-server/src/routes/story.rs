use axum::extract::{Path, State};
use axum::Json;

use crate::error::AppError;
use crate::state::AppState;

/// GET /api/story/{id}: one story with everything known about its run.
pub async fn get_story(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let result = app
        .blocking(move |s| {
            let story = s.get_story(&id)?;
            let state = s.run_state()?;
            let all = s.list_stories(None)?;
            let unmet: Vec<String> = story
                .unmet_dependencies(&all)
                .into_iter()
                .map(str::to_string)
                .collect();
            Ok(serde_json::json!({
                "status": story.status(state.current_story.as_deref()),
                "checkpoints": s.checkpoints_for(&story.id)?,
                "handoffs": s.handoff_state(&story.id)?,
                "executionLog": s.execution_log_for(&story.id)?,
                "unmetDependencies": unmet,
                "story": story,
            }))
        })
        .await?;
    Ok(Json(result))
}
