//! The execution loop behind `POST /run` `start`/`continue`.
//!
//! ```text
//!  sweep stale handoffs
//!        │
//!  answer pending gate? ──► skip / merge / feedback / proceed
//!        │
//!  ┌──► select story ──► external deps ─► validation ─► branch ─► agent ─► PR ─► merge
//!  │         │                 │              │                     │        │
//!  │         ▼                 ▼              ▼                     ▼        ▼
//!  │     complete /          gate           gate               failure    gate
//!  │     none runnable                                          streak
//!  └──── auto mode, until max iterations / stop / halt
//! ```
//!
//! Every stage is checkpointed, so a run that stops at a gate or crashes
//! resumes from the first stage without a checkpoint.

use claude_agent::{ClaudeAgentError, RunConfig};
use ralph_core::checkpoint::Checkpoint;
use ralph_core::execution::{
    self, AgentSignal, ExecutionConfig, GateAction, GateKind, GateRequest, GateResponse,
    PromptContext, Selection,
};
use ralph_core::prd::{Progress, StoryPatch};
use ralph_core::run_state::RunState;
use ralph_core::story::Story;
use ralph_core::types::{CheckpointStage, RunOutcome, RunStatus};
use ralph_core::{paths, RalphError};
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::error::AppError;
use crate::state::{AppState, EventKind};
use crate::vcs::Vcs;

const AUTO_CLARIFICATION: &str =
    "Auto mode: make reasonable assumptions based on existing codebase patterns.";
const AUTO_DEPS_REPORT: &str = "Auto mode: external dependencies assumed to be in place.";
const NO_SIGNAL: &str = "agent finished without signalling completion";

/// Why a run returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Halt {
    /// Every story in the version is merged or skipped.
    Complete,
    /// Work remains but every remaining story has unmet dependencies.
    NoRunnableStories,
    /// A story finished and the run does not continue on its own.
    StoryComplete,
    WaitingGate,
    Blocked,
    Stopped,
    MaxIterations,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub halt: Halt,
    pub iterations: u32,
    pub completed: Vec<String>,
    pub skipped: Vec<String>,
    pub gate: Option<GateRequest>,
    pub state: RunState,
    pub progress: Progress,
}

/// Result of driving one story as far as it will go.
#[derive(Debug)]
enum Step {
    Completed(String),
    Skipped(String),
    /// Failure below the threshold in auto mode; try the story again.
    Retry,
    Gate(GateRequest),
    Blocked(GateRequest),
}

enum AgentStep {
    Done,
    Failed(String),
    /// The agent asked for help. `recorded` is true when the `/signal`
    /// endpoint already counted the failure.
    Blocked { message: String, recorded: bool },
}

pub struct Orchestrator {
    app: AppState,
    version: String,
    config: ExecutionConfig,
    vcs: Option<Vcs>,
}

impl Orchestrator {
    pub fn new(app: AppState, version: impl Into<String>, config: ExecutionConfig) -> Self {
        let vcs = app
            .config
            .vcs
            .enabled
            .then(|| Vcs::new(&app.root, &app.config.vcs.remote));
        Self {
            app,
            version: version.into(),
            config,
            vcs,
        }
    }

    pub async fn run(self, gate_response: Option<GateResponse>) -> Result<RunReport, AppError> {
        self.app.stop_requested.store(false, Ordering::SeqCst);

        let version = self.version.clone();
        self.app.blocking(move |s| s.get_version(&version)).await?;
        self.sweep_stale().await?;
        if self.config.retry_clean {
            self.retry_clean().await?;
        }

        let mut report = Tally::default();
        let state = self.app.blocking(|s| s.run_state()).await?;

        if let (Some(story_id), true) = (
            state.current_story.clone(),
            matches!(state.status, RunStatus::WaitingGate | RunStatus::Blocked),
        ) {
            let blocked = state.status == RunStatus::Blocked;
            match gate_response {
                None => {
                    let gate = self.current_gate(&story_id, blocked).await?;
                    let halt = if blocked { Halt::Blocked } else { Halt::WaitingGate };
                    return self.finish(report, halt, Some(gate)).await;
                }
                Some(response) => {
                    if let Some(step) = self.answer_gate(&story_id, blocked, response).await? {
                        if let Some((halt, gate)) = self.absorb(&mut report, step) {
                            return self.finish(report, halt, gate).await;
                        }
                    }
                }
            }
        } else if gate_response.is_some() {
            return Err(AppError::bad_request(
                "gateResponse",
                "the run is not waiting at a gate",
            ));
        }

        loop {
            if self.app.stop_requested.load(Ordering::SeqCst) {
                tracing::info!("stop requested, ending run");
                return self.finish(report, Halt::Stopped, None).await;
            }
            if report.iterations >= self.config.max_iterations {
                return self.finish(report, Halt::MaxIterations, None).await;
            }
            report.iterations += 1;

            let story = match self.next_story().await? {
                Selection::Story(story) => *story,
                Selection::AllComplete => {
                    self.app.blocking(|s| s.set_status(RunStatus::Idle)).await?;
                    return self.finish(report, Halt::Complete, None).await;
                }
                Selection::NoneRunnable => {
                    self.app.blocking(|s| s.set_status(RunStatus::Idle)).await?;
                    return self.finish(report, Halt::NoRunnableStories, None).await;
                }
            };

            tracing::info!(story = %story.id, iteration = report.iterations, "working story");
            let step = self.work_story(story).await?;
            if let Some((halt, gate)) = self.absorb(&mut report, step) {
                return self.finish(report, halt, gate).await;
            }
        }
    }

    /// Fold a step into the tally; `Some` ends the run.
    fn absorb(&self, report: &mut Tally, step: Step) -> Option<(Halt, Option<GateRequest>)> {
        match step {
            Step::Completed(id) => {
                report.completed.push(id);
                if !self.config.auto_mode || self.config.one_shot_mode {
                    return Some((Halt::StoryComplete, None));
                }
                None
            }
            Step::Skipped(id) => {
                report.skipped.push(id);
                None
            }
            Step::Retry => None,
            Step::Gate(gate) => {
                self.app.emit(EventKind::Gate, &gate);
                Some((Halt::WaitingGate, Some(gate)))
            }
            Step::Blocked(gate) => {
                self.app.emit(EventKind::Gate, &gate);
                Some((Halt::Blocked, Some(gate)))
            }
        }
    }

    async fn finish(
        &self,
        report: Tally,
        halt: Halt,
        gate: Option<GateRequest>,
    ) -> Result<RunReport, AppError> {
        let version = self.version.clone();
        let (state, progress) = self
            .app
            .blocking(move |s| {
                let stories = s.list_stories(Some(&version))?;
                Ok((s.run_state()?, Progress::of(&stories)))
            })
            .await?;
        self.app.emit(EventKind::RunState, &state);
        tracing::info!(
            halt = ?halt,
            iterations = report.iterations,
            completed = report.completed.len(),
            "run finished"
        );
        Ok(RunReport {
            halt,
            iterations: report.iterations,
            completed: report.completed,
            skipped: report.skipped,
            gate,
            state,
            progress,
        })
    }

    // ---------------------------------------------------------------------------
    // Run bookkeeping
    // ---------------------------------------------------------------------------

    async fn sweep_stale(&self) -> Result<(), AppError> {
        let minutes = self.config.stale_handoff_minutes;
        let swept = self
            .app
            .blocking(move |s| s.sweep_stale_handoffs(minutes))
            .await?;
        for handoff in &swept {
            self.app.emit(EventKind::Handoff, handoff);
        }
        Ok(())
    }

    /// Drop the current story's checkpoints and failure streak so it starts
    /// over from the first stage.
    async fn retry_clean(&self) -> Result<(), AppError> {
        let state = self
            .app
            .blocking(|s| {
                let state = s.run_state()?;
                if let Some(id) = &state.current_story {
                    s.clear_checkpoints(id)?;
                    s.clear_failure()?;
                    s.hold_story(id, RunStatus::Running)?;
                    tracing::info!(story = %id, "cleared checkpoints for a clean retry");
                }
                s.run_state()
            })
            .await?;
        self.app.emit(EventKind::RunState, &state);
        Ok(())
    }

    async fn next_story(&self) -> Result<Selection, AppError> {
        let version = self.version.clone();
        let single = self.config.single_story_id.clone();
        self.app
            .blocking(move |s| {
                let state = s.run_state()?;
                if let (Some(id), true) = (&state.current_story, state.status.holds_story()) {
                    let story = s.get_story(id)?;
                    if !story.merged && !story.skipped {
                        return Ok(Selection::Story(Box::new(story)));
                    }
                    s.set_status(RunStatus::Idle)?;
                }
                let all = s.list_stories(None)?;
                let last = s.run_state()?.last_completed;
                execution::select_story(&all, &version, single.as_deref(), last.as_deref())
            })
            .await
    }

    async fn current_gate(&self, story_id: &str, blocked: bool) -> Result<GateRequest, AppError> {
        let id = story_id.to_string();
        self.app
            .blocking(move |s| {
                let story = s.get_story(&id)?;
                let checkpoints = s.checkpoints_for(&id)?;
                let state = s.run_state()?;
                Ok(gate_for(&story, &checkpoints, blocked, state.last_error.as_deref()))
            })
            .await
    }

    // ---------------------------------------------------------------------------
    // Gate answers
    // ---------------------------------------------------------------------------

    /// Apply a human answer to the held story. `None` means the story is
    /// ready to continue in the main loop.
    async fn answer_gate(
        &self,
        story_id: &str,
        blocked: bool,
        response: GateResponse,
    ) -> Result<Option<Step>, AppError> {
        let id = story_id.to_string();
        let (story, checkpoints) = self
            .app
            .blocking(move |s| Ok((s.get_story(&id)?, s.checkpoints_for(&id)?)))
            .await?;
        let gate = execution::pending_gate(&story, &checkpoints, blocked).ok_or_else(|| {
            RalphError::invalid_field(
                "gateResponse",
                format!("story {} is not waiting at a gate", story.id),
            )
        })?;
        response.check_against(gate)?;
        let answer = response.response;
        tracing::info!(
            story = %story.id,
            gate = %gate,
            action = answer.action.as_str(),
            "gate answered"
        );

        let id = story.id.clone();
        match (gate, answer.action) {
            (_, GateAction::Skip) => {
                let reason = format!("Skipped at {gate} gate");
                let skipped = self
                    .app
                    .blocking(move |s| {
                        let story = s.skip_story(&id, &reason)?;
                        s.clear_checkpoints(&id)?;
                        s.clear_failure()?;
                        s.set_status(RunStatus::Idle)?;
                        Ok(story)
                    })
                    .await?;
                self.app.emit(EventKind::StoryUpdate, &skipped);
                return Ok(Some(Step::Skipped(skipped.id)));
            }
            (GateKind::PrReview, GateAction::Merge) => {
                let pr_url = checkpoint_str(&checkpoints, CheckpointStage::PrCreated, "prUrl")
                    .or(story.pr_url.clone());
                self.app
                    .blocking(move |s| s.hold_story(&id, RunStatus::Running))
                    .await?;
                return self.merge(&story, pr_url).await.map(Some);
            }
            (GateKind::PrReview, GateAction::Feedback) => {
                let feedback = answer.feedback.unwrap_or_default();
                self.app
                    .blocking(move |s| {
                        s.increment_attempt()?;
                        let mut data = s
                            .get_checkpoint(&id, CheckpointStage::ValidationComplete)?
                            .map(|c| c.data)
                            .unwrap_or_else(|| serde_json::json!({}));
                        data["feedback"] = serde_json::Value::String(feedback);
                        s.save_checkpoint(&id, CheckpointStage::ValidationComplete, data)?;
                        s.clear_checkpoints_from(&id, CheckpointStage::ClaudeStarted)?;
                        s.update_story(
                            &id,
                            StoryPatch {
                                passes: Some(false),
                                ..Default::default()
                            },
                        )?;
                        s.hold_story(&id, RunStatus::Running)
                    })
                    .await?;
            }
            (GateKind::ExternalDeps, _) => {
                let report = answer.report.unwrap_or_default();
                self.app
                    .blocking(move |s| {
                        s.save_checkpoint(
                            &id,
                            CheckpointStage::ExternalDepsComplete,
                            serde_json::json!({ "report": report }),
                        )?;
                        s.hold_story(&id, RunStatus::Running)
                    })
                    .await?;
            }
            (GateKind::Validation, _) => {
                let clarification = answer.clarification;
                self.app
                    .blocking(move |s| {
                        s.save_checkpoint(
                            &id,
                            CheckpointStage::ValidationComplete,
                            serde_json::json!({ "clarification": clarification }),
                        )?;
                        s.clear_failure()?;
                        s.hold_story(&id, RunStatus::Running)
                    })
                    .await?;
            }
            (GateKind::Blocked, _) => {
                let clarification = answer.clarification;
                self.app
                    .blocking(move |s| {
                        if let Some(text) = clarification.filter(|c| !c.trim().is_empty()) {
                            let mut data = s
                                .get_checkpoint(&id, CheckpointStage::ValidationComplete)?
                                .map(|c| c.data)
                                .unwrap_or_else(|| serde_json::json!({}));
                            data["clarification"] = serde_json::Value::String(text);
                            s.save_checkpoint(&id, CheckpointStage::ValidationComplete, data)?;
                        }
                        s.clear_failure()?;
                        s.hold_story(&id, RunStatus::Running)
                    })
                    .await?;
            }
            // check_against only lets through actions listed for the gate.
            (GateKind::PrReview, _) => {}
        }
        Ok(None)
    }

    // ---------------------------------------------------------------------------
    // Stages
    // ---------------------------------------------------------------------------

    async fn work_story(&self, story: Story) -> Result<Step, AppError> {
        let id = story.id.clone();
        let lookup = id.clone();
        let checkpoints = self
            .app
            .blocking(move |s| s.checkpoints_for(&lookup))
            .await?;
        let has = |stage| checkpoints.iter().any(|c: &Checkpoint| c.stage == stage);

        if !story.external_deps.is_empty() && !has(CheckpointStage::ExternalDepsComplete) {
            if !self.config.auto_mode {
                return self.hold(&story, GateRequest::external_deps(&story)).await;
            }
            self.save(
                &id,
                CheckpointStage::ExternalDepsComplete,
                serde_json::json!({ "report": AUTO_DEPS_REPORT }),
            )
            .await?;
        }

        if !has(CheckpointStage::ValidationComplete) {
            let questions = execution::validate_story(&story);
            if questions.is_empty() {
                self.save(&id, CheckpointStage::ValidationComplete, serde_json::json!({}))
                    .await?;
            } else if self.config.auto_mode {
                self.save(
                    &id,
                    CheckpointStage::ValidationComplete,
                    serde_json::json!({
                        "clarification": AUTO_CLARIFICATION,
                        "questions": questions,
                    }),
                )
                .await?;
            } else {
                return self.hold(&story, GateRequest::validation(&story, questions)).await;
            }
        }

        let branch = story
            .working_branch
            .clone()
            .filter(|_| has(CheckpointStage::BranchCreated))
            .unwrap_or_else(|| execution::branch_name(&id));
        if let Some(vcs) = &self.vcs {
            if let Err(e) = vcs.checkout_branch(&branch, &self.config.base_branch).await {
                return self.fail(&id, format!("{e:#}")).await;
            }
        }
        if !has(CheckpointStage::BranchCreated) {
            let (sid, b, base) = (id.clone(), branch.clone(), self.config.base_branch.clone());
            let state = self
                .app
                .blocking(move |s| {
                    s.start_story(&sid, &b)?;
                    s.save_checkpoint(
                        &sid,
                        CheckpointStage::BranchCreated,
                        serde_json::json!({ "branch": b, "base": base }),
                    )?;
                    s.run_state()
                })
                .await?;
            self.app.emit(EventKind::RunState, &state);
        } else {
            let sid = id.clone();
            self.app
                .blocking(move |s| s.hold_story(&sid, RunStatus::Running))
                .await?;
        }

        if !has(CheckpointStage::ClaudeComplete) {
            match self.call_agent(&story, &branch).await? {
                AgentStep::Done => {}
                AgentStep::Failed(message) => return self.fail(&id, message).await,
                AgentStep::Blocked { message, recorded } => {
                    return self.agent_blocked(&id, message, recorded).await
                }
            }
        }

        let Some(vcs) = &self.vcs else {
            return self.complete(&id, None, None).await;
        };

        let pr_url = match checkpoint_str(&checkpoints, CheckpointStage::PrCreated, "prUrl") {
            Some(url) => url,
            None => match self.open_pr(vcs, &story, &branch).await {
                Ok(url) => {
                    let (sid, u) = (id.clone(), url.clone());
                    let updated = self
                        .app
                        .blocking(move |s| {
                            s.save_checkpoint(
                                &sid,
                                CheckpointStage::PrCreated,
                                serde_json::json!({ "prUrl": u }),
                            )?;
                            s.set_pr_url(&sid, &u)
                        })
                        .await?;
                    self.app.emit(EventKind::StoryUpdate, &updated);
                    url
                }
                Err(e) => return self.fail(&id, format!("{e:#}")).await,
            },
        };

        if !self.config.auto_mode {
            return self
                .hold(&story, GateRequest::pr_review(&story, Some(pr_url)))
                .await;
        }
        self.merge(&story, Some(pr_url)).await
    }

    async fn call_agent(&self, story: &Story, branch: &str) -> Result<AgentStep, AppError> {
        let template = self.prompt_template().await;
        let signal_url = self.app.signal_url();
        let (sid, st, br, url) = (
            story.id.clone(),
            story.clone(),
            branch.to_string(),
            signal_url.clone(),
        );
        let (attempt, log_id, prompt) = self
            .app
            .blocking(move |s| {
                let checkpoints = s.checkpoints_for(&sid)?;
                let attempt = if checkpoints
                    .iter()
                    .any(|c| c.stage == CheckpointStage::ClaudeStarted)
                {
                    s.increment_attempt()?
                } else {
                    s.run_state()?.attempts.max(1)
                };
                let state = s.run_state()?;
                let ctx =
                    PromptContext::from_checkpoints(&checkpoints, state.last_error.as_deref());
                let prompt = execution::build_prompt(&template, &st, &br, attempt, &url, &ctx);
                s.save_checkpoint(
                    &sid,
                    CheckpointStage::ClaudeStarted,
                    serde_json::json!({ "attempt": attempt }),
                )?;
                let log_id = s.log_run_started(&sid, attempt)?;
                Ok((attempt, log_id, prompt))
            })
            .await?;

        tracing::info!(story = %story.id, attempt, "invoking agent");
        self.app.emit(
            EventKind::Log,
            serde_json::json!({
                "storyId": story.id,
                "message": format!("agent started (attempt {attempt})"),
                "at": chrono::Utc::now(),
            }),
        );

        let config = RunConfig {
            command: self.app.agent_command().env("RALPH_STORY_ID", &story.id),
            prompt,
            timeout: Duration::from_secs(self.config.claude_timeout_secs),
        };
        let result = claude_agent::run(config).await;

        let sid = story.id.clone();
        let (step, outcome) = match result {
            Err(ClaudeAgentError::Timeout { seconds }) => (
                AgentStep::Failed(format!("agent timed out after {seconds}s")),
                RunOutcome::Timeout,
            ),
            Err(e) => {
                tracing::error!(story = %story.id, "agent failed: {e}");
                (AgentStep::Failed(e.to_string()), RunOutcome::Error)
            }
            Ok(out) if out.is_error() => {
                let detail = out
                    .result
                    .as_ref()
                    .and_then(|r| r.result.clone())
                    .unwrap_or_else(|| "agent reported an error".into());
                tracing::error!(story = %story.id, "agent returned an error result: {detail}");
                (AgentStep::Failed(detail), RunOutcome::Error)
            }
            Ok(out) => {
                let signal = execution::parse_agent_signal(&out.text, &story.id);
                self.settle_output(&sid, signal, &out.text).await?
            }
        };

        let error = match &step {
            AgentStep::Done => None,
            AgentStep::Failed(m) | AgentStep::Blocked { message: m, .. } => Some(m.clone()),
        };
        let metrics = self
            .app
            .blocking(move |s| {
                s.log_run_finished(log_id, outcome, error.as_deref())?;
                s.metrics()
            })
            .await?;
        self.app.emit(EventKind::Metrics, &metrics);
        Ok(step)
    }

    /// Decide what a cleanly exited agent call amounted to. A completion
    /// posted to `/signal` during the call counts even when the output
    /// carries no tag.
    async fn settle_output(
        &self,
        story_id: &str,
        signal: Option<AgentSignal>,
        text: &str,
    ) -> Result<(AgentStep, RunOutcome), AppError> {
        let id = story_id.to_string();
        match signal {
            Some(AgentSignal::Complete) | Some(AgentSignal::AllComplete) => {
                let summary = tail(text, 2000);
                let story = self
                    .app
                    .blocking(move |s| {
                        let story = s.mark_passed(&id)?;
                        s.save_checkpoint(
                            &id,
                            CheckpointStage::ClaudeComplete,
                            serde_json::json!({ "source": "output", "output": summary }),
                        )?;
                        s.clear_failure()?;
                        Ok(story)
                    })
                    .await?;
                self.app.emit(EventKind::StoryUpdate, &story);
                Ok((AgentStep::Done, RunOutcome::Complete))
            }
            Some(AgentSignal::Blocked(message)) => {
                let state = self.app.blocking(|s| s.run_state()).await?;
                Ok((blocked_step(message, state), RunOutcome::Blocked))
            }
            None => {
                let (signalled, state) = self
                    .app
                    .blocking(move |s| {
                        let signalled = s.has_checkpoint(&id, CheckpointStage::ClaudeComplete)?;
                        Ok((signalled, s.run_state()?))
                    })
                    .await?;
                if signalled {
                    Ok((AgentStep::Done, RunOutcome::Complete))
                } else if state.status == RunStatus::Blocked {
                    let message = state.last_error.unwrap_or_else(|| "Story blocked".into());
                    Ok((
                        AgentStep::Blocked {
                            message,
                            recorded: true,
                        },
                        RunOutcome::Blocked,
                    ))
                } else {
                    Ok((AgentStep::Failed(NO_SIGNAL.into()), RunOutcome::Error))
                }
            }
        }
    }

    async fn open_pr(&self, vcs: &Vcs, story: &Story, branch: &str) -> anyhow::Result<String> {
        if vcs.has_changes().await? {
            vcs.commit_all(&format!("feat({}): {}", story.id, story.title))
                .await?;
        }
        vcs.push(branch).await?;
        let body = execution::story_section(story);
        vcs.create_pr(
            branch,
            &self.config.base_branch,
            &format!("[{}] {}", story.id, story.title),
            &body,
        )
        .await
    }

    async fn merge(&self, story: &Story, pr_url: Option<String>) -> Result<Step, AppError> {
        let mut merge_commit = None;
        if let Some(vcs) = &self.vcs {
            let branch = story
                .working_branch
                .clone()
                .unwrap_or_else(|| execution::branch_name(&story.id));
            match vcs.merge_pr(&branch, &self.config.base_branch).await {
                Ok(sha) => merge_commit = sha,
                Err(e) => return self.fail(&story.id, format!("{e:#}")).await,
            }
        }
        self.complete(&story.id, pr_url, merge_commit).await
    }

    async fn complete(
        &self,
        story_id: &str,
        pr_url: Option<String>,
        merge_commit: Option<String>,
    ) -> Result<Step, AppError> {
        let id = story_id.to_string();
        let (story, state) = self
            .app
            .blocking(move |s| {
                s.mark_passed(&id)?;
                let story = s.mark_merged(&id, merge_commit.as_deref())?;
                let state = s.complete_story(&id, pr_url.as_deref())?;
                Ok((story, state))
            })
            .await?;
        self.app.emit(EventKind::StoryUpdate, &story);
        self.app.emit(EventKind::RunState, &state);
        Ok(Step::Completed(story.id))
    }

    // ---------------------------------------------------------------------------
    // Holding and failing
    // ---------------------------------------------------------------------------

    async fn hold(&self, story: &Story, gate: GateRequest) -> Result<Step, AppError> {
        let id = story.id.clone();
        let state = self
            .app
            .blocking(move |s| s.hold_story(&id, RunStatus::WaitingGate))
            .await?;
        self.app.emit(EventKind::RunState, &state);
        tracing::info!(story = %story.id, gate = %gate.kind, "waiting at gate");
        Ok(Step::Gate(gate))
    }

    /// Count a failure. Auto mode retries until the same failure has been
    /// seen `failure_threshold` times; otherwise the story is blocked.
    async fn fail(&self, story_id: &str, message: String) -> Result<Step, AppError> {
        tracing::warn!(story = story_id, "story attempt failed: {message}");
        let msg = message.clone();
        let count = self
            .app
            .blocking(move |s| s.record_failure(&msg))
            .await?;
        self.after_failure(story_id, message, count).await
    }

    async fn agent_blocked(
        &self,
        story_id: &str,
        message: String,
        recorded: bool,
    ) -> Result<Step, AppError> {
        let count = if recorded {
            self.app.blocking(|s| s.run_state()).await?.failure_count
        } else {
            let (id, msg) = (story_id.to_string(), message.clone());
            self.app
                .blocking(move |s| s.block_story(&id, &msg))
                .await?
                .failure_count
        };
        self.after_failure(story_id, message, count).await
    }

    async fn after_failure(
        &self,
        story_id: &str,
        message: String,
        count: u32,
    ) -> Result<Step, AppError> {
        let id = story_id.to_string();
        let retry = self.config.auto_mode && count < self.config.failure_threshold;
        let status = if retry {
            RunStatus::Running
        } else {
            RunStatus::Blocked
        };
        let state = self
            .app
            .blocking(move |s| s.hold_story(&id, status))
            .await?;
        self.app.emit(EventKind::RunState, &state);
        if retry {
            tracing::info!(
                story = story_id,
                failure_count = count,
                "retrying after failure"
            );
            return Ok(Step::Retry);
        }
        tracing::warn!(story = story_id, failure_count = count, "story blocked");
        Ok(Step::Blocked(GateRequest::blocked(story_id, Some(&message))))
    }

    async fn save(
        &self,
        story_id: &str,
        stage: CheckpointStage,
        data: serde_json::Value,
    ) -> Result<(), AppError> {
        let id = story_id.to_string();
        self.app
            .blocking(move |s| s.save_checkpoint(&id, stage, data))
            .await?;
        Ok(())
    }

    async fn prompt_template(&self) -> String {
        match tokio::fs::read_to_string(paths::prompt_path(&self.app.root)).await {
            Ok(t) if !t.trim().is_empty() => t,
            _ => execution::DEFAULT_PROMPT.to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct Tally {
    iterations: u32,
    completed: Vec<String>,
    skipped: Vec<String>,
}

fn checkpoint_str(checkpoints: &[Checkpoint], stage: CheckpointStage, key: &str) -> Option<String> {
    checkpoints
        .iter()
        .find(|c| c.stage == stage)
        .and_then(|c| c.data.get(key))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// An output `<story-blocked>` tag. When the agent also posted a blocked
/// `/signal` during the call the run is already blocked and the failure
/// already counted.
fn blocked_step(message: String, state: RunState) -> AgentStep {
    if state.status == RunStatus::Blocked {
        AgentStep::Blocked {
            message: state.last_error.unwrap_or(message),
            recorded: true,
        }
    } else {
        AgentStep::Blocked {
            message,
            recorded: false,
        }
    }
}

/// The last `max` characters of `text`.
fn tail(text: &str, max: usize) -> String {
    let skip = text.chars().count().saturating_sub(max);
    text.chars().skip(skip).collect()
}

/// Rebuild the gate a held story is waiting at.
pub fn gate_for(
    story: &Story,
    checkpoints: &[Checkpoint],
    blocked: bool,
    last_error: Option<&str>,
) -> GateRequest {
    match execution::pending_gate(story, checkpoints, blocked) {
        Some(GateKind::ExternalDeps) => GateRequest::external_deps(story),
        Some(GateKind::Validation) => {
            GateRequest::validation(story, execution::validate_story(story))
        }
        Some(GateKind::PrReview) => GateRequest::pr_review(
            story,
            checkpoint_str(checkpoints, CheckpointStage::PrCreated, "prUrl")
                .or(story.pr_url.clone()),
        ),
        Some(GateKind::Blocked) | None => GateRequest::blocked(&story.id, last_error),
    }
}
