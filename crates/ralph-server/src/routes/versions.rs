use axum::extract::State;
use axum::Json;

use crate::error::AppError;
use crate::state::AppState;

/// GET /api/versions: every imported version with its progress.
pub async fn list_versions(
    State(app): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let versions = app.blocking(|s| s.list_versions()).await?;
    Ok(Json(serde_json::to_value(versions)?))
}
