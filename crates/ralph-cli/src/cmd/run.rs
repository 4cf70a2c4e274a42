use crate::output::print_json;
use anyhow::Context;
use ralph_core::execution::{
    ExecutionConfig, ExecutionOverrides, GateAction, GateAnswer, GateRequest, GateResponse,
};
use ralph_server::orchestrator::{Halt, Orchestrator, RunReport};
use ralph_server::routes::run::resolve_version;
use ralph_server::state::AppState;
use std::path::Path;

// ---------------------------------------------------------------------------
// RunExit: typed non-zero exit codes (no std::process::exit in command code)
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum RunExit {
    Blocked { story_id: String },
    HumanGateRequired { gate: String, story_id: String },
}

impl RunExit {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunExit::Blocked { .. } => 2,
            RunExit::HumanGateRequired { .. } => 3,
        }
    }

    fn from_gate(halt: Halt, gate: &GateRequest) -> Option<Self> {
        match halt {
            Halt::Blocked => Some(RunExit::Blocked {
                story_id: gate.story_id.clone(),
            }),
            Halt::WaitingGate => Some(RunExit::HumanGateRequired {
                gate: gate.kind.to_string(),
                story_id: gate.story_id.clone(),
            }),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunExit::Blocked { story_id } => {
                write!(f, "story {story_id} is blocked; answer with --answer retry|clarify|skip")
            }
            RunExit::HumanGateRequired { gate, story_id } => {
                write!(f, "story {story_id} is waiting at the {gate} gate")
            }
        }
    }
}

impl std::error::Error for RunExit {}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

pub struct RunArgs {
    pub version: Option<String>,
    pub auto: bool,
    pub one_shot: bool,
    pub story: Option<String>,
    pub max_iterations: Option<u32>,
    pub retry_clean: bool,
    pub answer: Option<String>,
    pub message: Option<String>,
}

impl RunArgs {
    fn overrides(&self) -> ExecutionOverrides {
        ExecutionOverrides {
            max_iterations: self.max_iterations,
            auto_mode: self.auto.then_some(true),
            one_shot_mode: self.one_shot.then_some(true),
            single_story_id: self.story.clone(),
            retry_clean: self.retry_clean.then_some(true),
            ..Default::default()
        }
    }

    /// The gate answer, if one was given. The message travels in every text
    /// field; the gate being answered reads the one it understands.
    fn gate_response(&self) -> anyhow::Result<Option<GateResponse>> {
        let Some(answer) = self.answer.as_deref() else {
            if self.message.is_some() {
                anyhow::bail!("--message needs --answer");
            }
            return Ok(None);
        };
        let action: GateAction = serde_json::from_value(serde_json::json!(answer))
            .with_context(|| {
                format!(
                    "unknown gate answer '{answer}' \
                     (expected proceed, clarify, skip, merge, feedback, retry)"
                )
            })?;
        Ok(Some(GateResponse {
            kind: None,
            response: GateAnswer {
                action,
                clarification: self.message.clone(),
                report: self.message.clone(),
                feedback: self.message.clone(),
            },
        }))
    }
}

pub fn run(root: &Path, args: RunArgs, json: bool) -> anyhow::Result<()> {
    let gate_response = args.gate_response()?;
    let app = AppState::standalone(root.to_path_buf())
        .context("failed to load project (run `ralph init` first)")?;
    let config = ExecutionConfig::from_defaults(&app.config.execution)
        .with_overrides(args.overrides())?;

    let rt = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    let report = rt.block_on(async {
        let requested = args.version.clone();
        let version = app
            .blocking(move |s| {
                let state = s.run_state()?;
                resolve_version(s, requested.as_deref(), &state)
            })
            .await
            .map_err(|e| e.0)?;
        tracing::info!(version = %version, auto = config.auto_mode, "run started");
        Orchestrator::new(app, version, config)
            .run(gate_response)
            .await
            .map_err(|e| e.0)
    })?;

    if json {
        print_json(&report)?;
    } else {
        print_report(&report);
    }

    match report.gate.as_ref().and_then(|g| RunExit::from_gate(report.halt, g)) {
        Some(exit) => Err(exit.into()),
        None => Ok(()),
    }
}

fn print_report(report: &RunReport) {
    println!(
        "Run halted: {} after {} iteration(s)",
        halt_label(report.halt),
        report.iterations
    );
    if !report.completed.is_empty() {
        println!("  completed: {}", report.completed.join(", "));
    }
    if !report.skipped.is_empty() {
        println!("  skipped:   {}", report.skipped.join(", "));
    }
    let p = &report.progress;
    println!(
        "  progress:  {}/{} merged, {} skipped ({}%)",
        p.merged, p.total, p.skipped, p.percentage
    );

    if let Some(gate) = &report.gate {
        println!("\nGate [{}] on {}: {}", gate.kind, gate.story_id, gate.message);
        for q in &gate.questions {
            println!("  - {q}");
        }
        for dep in &gate.external_deps {
            println!("  - {}", dep.name);
        }
        if let Some(url) = &gate.pr_url {
            println!("  PR: {url}");
        }
        let options: Vec<&str> = gate.options.iter().map(|o| o.as_str()).collect();
        println!("  answer with: ralph run --answer <{}>", options.join("|"));
    }
}

fn halt_label(halt: Halt) -> &'static str {
    match halt {
        Halt::Complete => "all stories done",
        Halt::NoRunnableStories => "no runnable stories",
        Halt::StoryComplete => "story complete",
        Halt::WaitingGate => "waiting at gate",
        Halt::Blocked => "blocked",
        Halt::Stopped => "stopped",
        Halt::MaxIterations => "max iterations reached",
    }
}
