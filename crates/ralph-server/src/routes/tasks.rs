use axum::extract::{Path, Query, State};
use axum::Json;
use ralph_core::task::{TaskAction, TaskFilter};
use ralph_core::types::TaskKind;
use serde::Deserialize;

use super::prd::enqueue;
use crate::error::AppError;
use crate::extract::JsonBody;
use crate::state::{AppState, EventKind};

/// GET /api/tasks: newest first, with the unread count for badges.
pub async fn list_tasks(
    State(app): State<AppState>,
    Query(filter): Query<TaskFilter>,
) -> Result<Json<serde_json::Value>, AppError> {
    let (tasks, unread) = app
        .blocking(move |s| Ok((s.list_tasks(&filter)?, s.unread_task_count()?)))
        .await?;
    Ok(Json(serde_json::json!({ "tasks": tasks, "unread": unread })))
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskBody {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
}

/// POST /api/tasks: queue a task of any kind.
pub async fn create_task(
    State(app): State<AppState>,
    JsonBody(body): JsonBody<CreateTaskBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let kind: TaskKind = body
        .kind
        .as_deref()
        .ok_or_else(|| AppError::bad_request("type", "is required"))?
        .parse()?;
    let params = body.params.unwrap_or_else(|| serde_json::json!({}));
    enqueue(&app, kind, body.version, params).await
}

/// POST /api/tasks/read-all
pub async fn mark_all_read(
    State(app): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let updated = app.blocking(|s| s.mark_all_tasks_read()).await?;
    Ok(Json(serde_json::json!({ "updated": updated })))
}

/// GET /api/tasks/{id}
pub async fn get_task(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let task = app.blocking(move |s| s.get_task(&id)).await?;
    Ok(Json(serde_json::to_value(task)?))
}

#[derive(Debug, Deserialize)]
pub struct PatchTaskBody {
    pub action: Option<String>,
}

/// PATCH /api/tasks/{id}: `read`, `delete` (soft) or `restore`.
pub async fn patch_task(
    State(app): State<AppState>,
    Path(id): Path<String>,
    JsonBody(body): JsonBody<PatchTaskBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let action: TaskAction = body
        .action
        .as_deref()
        .ok_or_else(|| AppError::bad_request("action", "is required"))?
        .parse()?;
    let task = app
        .blocking(move |s| s.apply_task_action(&id, action))
        .await?;
    app.emit(EventKind::TaskUpdate, &task);
    Ok(Json(serde_json::to_value(task)?))
}

/// DELETE /api/tasks/{id}: permanent removal.
pub async fn delete_task(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let task_id = id.clone();
    app.blocking(move |s| s.delete_task(&task_id)).await?;
    tracing::info!(task = %id, "task deleted");
    Ok(Json(serde_json::json!({ "deleted": true, "id": id })))
}
