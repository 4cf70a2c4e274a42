use axum::extract::State;
use axum::Json;

use crate::error::AppError;
use crate::state::AppState;

/// GET /api/state: the run-state row.
pub async fn get_state(State(app): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let state = app.blocking(|s| s.run_state()).await?;
    Ok(Json(serde_json::to_value(state)?))
}
