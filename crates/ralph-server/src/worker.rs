//! Background worker for the LLM task queue.
//!
//! Tasks run one at a time in FIFO order. The worker sleeps on
//! [`AppState::task_notify`] and also polls, so tasks queued by the CLI
//! (which writes the database directly) are picked up too.

use claude_agent::RunConfig;
use ralph_core::task::{Task, KEEP_FINISHED_TASKS};
use std::time::Duration;

use crate::error::AppError;
use crate::state::{AppState, EventKind};

const POLL_INTERVAL: Duration = Duration::from_secs(5);

pub async fn run_worker(app: AppState) {
    match app.blocking(|s| s.fail_interrupted_tasks()).await {
        Ok(0) => {}
        Ok(n) => tracing::warn!("marked {n} interrupted task(s) as failed"),
        Err(e) => tracing::error!("task worker could not recover tasks: {:#}", e.0),
    }

    loop {
        match process_next(&app).await {
            Ok(true) => continue,
            Ok(false) => {}
            Err(e) => tracing::error!("task worker: {:#}", e.0),
        }
        let _ = tokio::time::timeout(POLL_INTERVAL, app.task_notify.notified()).await;
    }
}

/// Run the oldest queued task. Returns false when the queue is empty.
pub async fn process_next(app: &AppState) -> Result<bool, AppError> {
    let claimed = app
        .blocking(|s| match s.next_queued_task()? {
            Some(task) => Ok(Some(s.start_task(&task.id)?)),
            None => Ok(None),
        })
        .await?;
    let Some(task) = claimed else {
        return Ok(false);
    };
    tracing::info!(task = %task.id, kind = %task.kind, "task started");
    app.emit(EventKind::TaskUpdate, &task);

    let finished = match execute(app, &task).await {
        Ok(value) => {
            let t = task.clone();
            app.blocking(move |s| {
                let result = s.task_result(&t, value)?;
                s.complete_task(&t.id, result)
            })
            .await?
        }
        Err(message) => {
            tracing::error!(task = %task.id, "task failed: {message}");
            let id = task.id.clone();
            app.blocking(move |s| s.fail_task(&id, &message)).await?
        }
    };
    let removed = app
        .blocking(|s| s.cleanup_tasks(KEEP_FINISHED_TASKS))
        .await?;
    if removed > 0 {
        tracing::debug!("cleaned up {removed} finished task(s)");
    }
    tracing::info!(task = %finished.id, status = %finished.status, "task finished");
    app.emit(EventKind::TaskUpdate, &finished);
    Ok(true)
}

/// Build the prompt, run the agent and pull the JSON object out of its reply.
async fn execute(app: &AppState, task: &Task) -> Result<serde_json::Value, String> {
    let t = task.clone();
    let prompt = app
        .blocking(move |s| s.task_prompt(&t))
        .await
        .map_err(|e| format!("{:#}", e.0))?;

    let config = RunConfig {
        command: app.agent_command(),
        prompt,
        timeout: Duration::from_secs(app.config.execution.claude_timeout_secs),
    };
    let out = claude_agent::run(config).await.map_err(|e| e.to_string())?;
    if out.is_error() {
        return Err(out
            .result
            .and_then(|r| r.result)
            .unwrap_or_else(|| "agent reported an error".into()));
    }
    claude_agent::extract_json(&out.text).map_err(|e| e.to_string())
}
