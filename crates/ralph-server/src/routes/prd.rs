use axum::extract::{Query, State};
use axum::Json;
use ralph_core::prd::{AlignmentChanges, PrdDocument, StoryPatch};
use ralph_core::prompts::validate_task_params;
use ralph_core::types::TaskKind;
use serde::Deserialize;

use super::run::resolve_version;
use crate::error::AppError;
use crate::extract::JsonBody;
use crate::state::{AppState, EventKind};

#[derive(Debug, Deserialize)]
pub struct PrdQuery {
    pub version: Option<String>,
}

/// GET /api/prd: phases, epics and stories of one version.
pub async fn get_prd(
    State(app): State<AppState>,
    Query(query): Query<PrdQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let prd = app
        .blocking(move |s| {
            let state = s.run_state()?;
            let version = resolve_version(s, query.version.as_deref(), &state)?;
            s.get_prd(&version)
        })
        .await?;
    Ok(Json(serde_json::to_value(prd)?))
}

/// POST /api/prd: import (upsert) a PRD document.
pub async fn import_prd(
    State(app): State<AppState>,
    JsonBody(doc): JsonBody<PrdDocument>,
) -> Result<Json<serde_json::Value>, AppError> {
    let summary = app.blocking(move |s| s.import_prd(doc)).await?;
    tracing::info!(
        version = %summary.version,
        created = summary.created.len(),
        updated = summary.updated.len(),
        "PRD imported"
    );
    app.emit(EventKind::StoryUpdate, &summary);
    Ok(Json(serde_json::to_value(summary)?))
}

#[derive(Debug, Deserialize)]
pub struct StoryUpdate {
    #[serde(alias = "storyId")]
    pub id: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(flatten)]
    pub patch: StoryPatch,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum UpdateBody {
    Many {
        #[serde(default)]
        version: Option<String>,
        stories: Vec<StoryUpdate>,
    },
    One(StoryUpdate),
}

/// PUT /api/prd: partial updates to one story (`{id, ...fields}`) or many
/// (`{stories: [...]}`), applied in order. A `version` limits bare ids to
/// that version.
pub async fn update_stories(
    State(app): State<AppState>,
    JsonBody(body): JsonBody<UpdateBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let updates = match body {
        UpdateBody::Many { version, stories } => stories
            .into_iter()
            .map(|u| StoryUpdate {
                version: u.version.or_else(|| version.clone()),
                ..u
            })
            .collect(),
        UpdateBody::One(update) => vec![update],
    };
    let stories = app
        .blocking(move |s| {
            updates
                .into_iter()
                .map(|u| {
                    let story = s.get_story_in(u.version.as_deref(), &u.id)?;
                    s.update_story(&story.id, u.patch)
                })
                .collect::<ralph_core::Result<Vec<_>>>()
        })
        .await?;
    for story in &stories {
        app.emit(EventKind::StoryUpdate, story);
    }
    Ok(Json(serde_json::json!({ "stories": stories })))
}

// ---------------------------------------------------------------------------
// LLM-assisted refinement
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskBody {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

/// Queue a task of `kind`, wake the worker and return the queued record.
pub(crate) async fn enqueue(
    app: &AppState,
    kind: TaskKind,
    version: Option<String>,
    params: serde_json::Value,
) -> Result<Json<serde_json::Value>, AppError> {
    validate_task_params(kind, &params)?;
    let task = app
        .blocking(move |s| {
            let state = s.run_state()?;
            let version = match (kind, params.get("storyId").and_then(|v| v.as_str())) {
                (TaskKind::StoryEdit, Some(id)) if version.is_none() => s.get_story(id)?.version,
                _ => resolve_version(s, version.as_deref(), &state)?,
            };
            s.create_task(kind, Some(&version), params)
        })
        .await?;
    app.task_notify.notify_one();
    app.emit(EventKind::TaskUpdate, &task);
    Ok(Json(serde_json::json!({ "task": task })))
}

/// POST /api/prd/refine: queue a refine task over the open stories.
pub async fn refine(
    State(app): State<AppState>,
    JsonBody(body): JsonBody<TaskBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    enqueue(&app, TaskKind::Refine, body.version, body.params.into()).await
}

/// POST /api/prd/refine/edit: queue an edit of one story (`storyId`,
/// `requestedChanges`).
pub async fn refine_story(
    State(app): State<AppState>,
    JsonBody(body): JsonBody<TaskBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    enqueue(&app, TaskKind::StoryEdit, body.version, body.params.into()).await
}

/// POST /api/prd/generate: queue generation of new stories from `description`.
pub async fn generate(
    State(app): State<AppState>,
    JsonBody(body): JsonBody<TaskBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    enqueue(&app, TaskKind::Generate, body.version, body.params.into()).await
}

/// POST /api/prd/align: queue an alignment review against an optional `vision`.
pub async fn align(
    State(app): State<AppState>,
    JsonBody(body): JsonBody<TaskBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    enqueue(&app, TaskKind::Align, body.version, body.params.into()).await
}

#[derive(Debug, Deserialize)]
pub struct ApplyAlignmentBody {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(flatten)]
    pub changes: AlignmentChanges,
}

/// PUT /api/prd/align: apply accepted alignment changes. Removed stories
/// are skipped, never deleted.
pub async fn apply_alignment(
    State(app): State<AppState>,
    JsonBody(body): JsonBody<ApplyAlignmentBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let (version, summary, stories) = app
        .blocking(move |s| {
            let state = s.run_state()?;
            let version = resolve_version(s, body.version.as_deref(), &state)?;
            let summary = s.apply_alignment(&version, body.changes)?;
            let stories = s.list_stories(Some(&version))?;
            Ok((version, summary, stories))
        })
        .await?;
    tracing::info!(
        version = %version,
        applied = summary.applied,
        added = summary.added,
        removed = summary.removed,
        "alignment applied"
    );
    app.emit(
        EventKind::StoryUpdate,
        serde_json::json!({ "version": version, "alignment": summary }),
    );
    Ok(Json(serde_json::json!({
        "version": version,
        "summary": summary,
        "stories": stories,
    })))
}
