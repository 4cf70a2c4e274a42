use axum::extract::{Query, State};
use axum::Json;
use ralph_core::execution::{ExecutionConfig, ExecutionOverrides, GateResponse};
use ralph_core::prd::Progress;
use ralph_core::run_state::RunState;
use ralph_core::types::RunStatus;
use ralph_core::{scoring, RalphError, Store};
use serde::Deserialize;
use std::sync::atomic::Ordering;

use crate::error::AppError;
use crate::extract::JsonBody;
use crate::orchestrator::{gate_for, Orchestrator};
use crate::state::{AppState, EventKind};

/// Pick the version a request is about: the one named, else the current
/// story's, else the most recently imported.
pub fn resolve_version(
    store: &Store,
    requested: Option<&str>,
    state: &RunState,
) -> ralph_core::Result<String> {
    if let Some(v) = requested.filter(|v| !v.trim().is_empty()) {
        return Ok(store.get_version(v)?.id);
    }
    if let Some(story) = state
        .current_story
        .as_deref()
        .and_then(|id| store.find_story(id).transpose())
    {
        return Ok(story?.version);
    }
    store
        .list_versions()?
        .into_iter()
        .max_by_key(|v| v.version.created_at)
        .map(|v| v.version.id)
        .ok_or_else(|| {
            RalphError::invalid_field("version", "is required; no PRD has been imported")
        })
}

#[derive(Debug, Deserialize)]
pub struct RunQuery {
    pub version: Option<String>,
}

/// GET /api/run: run state, progress and what would be worked next.
pub async fn get_run(
    State(app): State<AppState>,
    Query(query): Query<RunQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let result = app
        .blocking(move |s| {
            let state = s.run_state()?;
            let version = resolve_version(s, query.version.as_deref(), &state)?;
            let all = s.list_stories(None)?;
            let in_version: Vec<_> = all
                .iter()
                .filter(|st| st.version == version)
                .cloned()
                .collect();
            let scored = scoring::score_stories(&all, &version, state.last_completed.as_deref());
            let next = scored
                .first()
                .and_then(|sc| all.iter().find(|st| st.id == sc.story_id));

            let gate = match (&state.current_story, state.status) {
                (Some(id), RunStatus::WaitingGate | RunStatus::Blocked) => {
                    let story = s.get_story(id)?;
                    let checkpoints = s.checkpoints_for(id)?;
                    Some(gate_for(
                        &story,
                        &checkpoints,
                        state.status == RunStatus::Blocked,
                        state.last_error.as_deref(),
                    ))
                }
                _ => None,
            };

            Ok(serde_json::json!({
                "version": version,
                "state": state,
                "progress": Progress::of(&in_version),
                "nextStory": next,
                "scoredStories": scored,
                "gate": gate,
            }))
        })
        .await?;
    Ok(Json(result))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunAction {
    Start,
    Continue,
    Stop,
    Reset,
}

impl std::str::FromStr for RunAction {
    type Err = RalphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(RunAction::Start),
            "continue" => Ok(RunAction::Continue),
            "stop" => Ok(RunAction::Stop),
            "reset" => Ok(RunAction::Reset),
            _ => Err(RalphError::InvalidAction {
                action: s.to_string(),
                expected: "start, continue, stop, reset".into(),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunBody {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub config: Option<ExecutionOverrides>,
    #[serde(default)]
    pub gate_response: Option<GateResponse>,
}

/// POST /api/run: `start`/`continue` drive the loop until it halts; `stop`
/// and `reset` return immediately.
pub async fn post_run(
    State(app): State<AppState>,
    JsonBody(body): JsonBody<RunBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let action: RunAction = body
        .action
        .as_deref()
        .ok_or_else(|| RalphError::invalid_field("action", "is required"))?
        .parse()?;

    match action {
        RunAction::Stop => {
            app.stop_requested.store(true, Ordering::SeqCst);
            let state = app.blocking(|s| s.set_status(RunStatus::Idle)).await?;
            tracing::info!("run stop requested");
            app.emit(EventKind::RunState, &state);
            Ok(Json(serde_json::json!({ "action": "stop", "state": state })))
        }
        RunAction::Reset => {
            let minutes = app.config.execution.stale_handoff_minutes;
            let (swept, state) = app
                .blocking(move |s| Ok((s.sweep_stale_handoffs(minutes)?, s.reset_state()?)))
                .await?;
            for handoff in &swept {
                app.emit(EventKind::Handoff, handoff);
            }
            app.emit(EventKind::RunState, &state);
            Ok(Json(serde_json::json!({
                "action": "reset",
                "state": state,
                "timedOutHandoffs": swept.len(),
            })))
        }
        RunAction::Start | RunAction::Continue => {
            let _guard = app
                .run_lock
                .clone()
                .try_lock_owned()
                .map_err(|_| AppError::conflict("execution already running"))?;

            let config = ExecutionConfig::from_defaults(&app.config.execution)
                .with_overrides(body.config.unwrap_or_default())?;
            let requested = body.version;
            let version = app
                .blocking(move |s| {
                    let state = s.run_state()?;
                    resolve_version(s, requested.as_deref(), &state)
                })
                .await?;

            tracing::info!(version = %version, auto = config.auto_mode, ?action, "run requested");
            let report = Orchestrator::new(app.clone(), version, config)
                .run(body.gate_response)
                .await?;
            Ok(Json(serde_json::to_value(report)?))
        }
    }
}
