use axum::extract::State;
use axum::Json;

use crate::error::AppError;
use crate::state::AppState;

/// GET /api/metrics: execution totals, story counts and per-story stats.
pub async fn get_metrics(State(app): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let metrics = app.blocking(|s| s.metrics()).await?;
    Ok(Json(serde_json::to_value(metrics)?))
}
