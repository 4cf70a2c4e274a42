use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::process::AgentProcess;
use crate::types::{ContentBlock, ResultLine, StreamLine};
use crate::{ClaudeAgentError, Result};

// ─── AgentCommand ─────────────────────────────────────────────────────────

/// How to launch the agent CLI. The prompt is always sent on stdin.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl AgentCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        AgentCommand {
            program: program.into(),
            args,
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Fail early with [`ClaudeAgentError::NotInstalled`] when a bare program
    /// name is not on `PATH`.
    pub fn check_installed(&self) -> Result<()> {
        if self.program.contains(std::path::MAIN_SEPARATOR) {
            return Ok(());
        }
        which::which(&self.program)
            .map(|_| ())
            .map_err(|_| ClaudeAgentError::NotInstalled(self.program.clone()))
    }
}

// ─── RunConfig / RunResult ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub command: AgentCommand,
    pub prompt: String,
    /// Wall-clock limit for the whole call; the process is killed after it.
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RunResult {
    /// Raw stdout.
    pub stdout: String,
    pub stderr: String,
    /// Human-readable text: the assistant text when stdout is stream-json,
    /// otherwise stdout itself.
    pub text: String,
    /// The terminal `result` line, when the agent emitted stream-json.
    pub result: Option<ResultLine>,
    pub duration: Duration,
}

impl RunResult {
    pub fn is_error(&self) -> bool {
        self.result.as_ref().is_some_and(|r| r.is_error)
    }
}

// ─── Public API ───────────────────────────────────────────────────────────

/// Run the agent once with `config.prompt` on stdin and wait for it to exit.
///
/// A non-zero exit is [`ClaudeAgentError::Exit`] carrying both streams; going
/// over `config.timeout` kills the process and returns
/// [`ClaudeAgentError::Timeout`].
pub async fn run(config: RunConfig) -> Result<RunResult> {
    let started = Instant::now();
    tracing::debug!(program = %config.command.program, "starting agent");
    let process = AgentProcess::spawn(&config.command, &config.prompt)?;
    finish(process, config.timeout, started).await
}

pub(crate) async fn finish(
    process: AgentProcess,
    timeout: Duration,
    started: Instant,
) -> Result<RunResult> {
    let output = match tokio::time::timeout(timeout, process.wait()).await {
        Ok(output) => output?,
        Err(_) => {
            tracing::warn!("agent timed out after {}s", timeout.as_secs());
            return Err(ClaudeAgentError::Timeout {
                seconds: timeout.as_secs(),
            });
        }
    };

    if !output.status.success() {
        return Err(ClaudeAgentError::Exit {
            code: output.status.code(),
            stderr: output.stderr,
            stdout: output.stdout,
        });
    }

    let (text, result) = extract_result_text(&output.stdout);
    Ok(RunResult {
        text,
        result,
        stdout: output.stdout,
        stderr: output.stderr,
        duration: started.elapsed(),
    })
}

/// Split agent stdout into readable text and the terminal result line.
///
/// Stream-json output is reduced to its assistant text blocks plus the final
/// result text; anything else is returned unchanged.
pub fn extract_result_text(stdout: &str) -> (String, Option<ResultLine>) {
    let mut streamed = false;
    let mut parts: Vec<String> = Vec::new();
    let mut result = None;

    for line in stdout.lines() {
        match StreamLine::parse(line) {
            Some(Ok(StreamLine::Assistant(a))) => {
                streamed = true;
                for block in a.message.content {
                    if let ContentBlock::Text { text } = block {
                        parts.push(text);
                    }
                }
            }
            Some(Ok(StreamLine::Result(r))) => {
                streamed = true;
                result = Some(r);
            }
            Some(Ok(StreamLine::Other)) => streamed = true,
            Some(Err(e)) => tracing::trace!("non stream-json line: {e}"),
            None => {}
        }
    }

    if !streamed {
        return (stdout.to_string(), None);
    }
    if let Some(text) = result.as_ref().and_then(|r| r.result.as_deref()) {
        if !parts.iter().any(|p| p == text) {
            parts.push(text.to_string());
        }
    }
    (parts.join("\n"), result)
}

/// Pull the JSON object out of an agent's answer: the whole text, a fenced
/// ```json block, or the span from the first `{` to the last `}`.
pub fn extract_json(text: &str) -> Result<serde_json::Value> {
    let trimmed = text.trim();
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if v.is_object() {
            return Ok(v);
        }
    }

    let mut rest = trimmed;
    while let Some(start) = rest.find("```") {
        let after = &rest[start + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let Some(end) = after[body_start..].find("```") else {
            break;
        };
        let body = after[body_start..body_start + end].trim();
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(body) {
            if v.is_object() {
                return Ok(v);
            }
        }
        rest = &after[body_start + end + 3..];
    }

    let span = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(a), Some(b)) if a < b => &trimmed[a..=b],
        _ => trimmed,
    };
    serde_json::from_str(span).map_err(|source| ClaudeAgentError::Parse {
        line: span.chars().take(200).collect(),
        source,
    })
}

// ─── Tests ────────────────────────────────────────────────────────────────
