use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::runner::AgentCommand;
use crate::{ClaudeAgentError, Result};

// ─── AgentProcess ─────────────────────────────────────────────────────────

/// A running agent CLI. The prompt is written to stdin, which is then
/// closed; stdout and stderr are drained by background tasks so a chatty
/// agent never blocks on a full pipe.
pub(crate) struct AgentProcess {
    child: Child,
    stdout_task: JoinHandle<String>,
    stderr_task: JoinHandle<String>,
}

pub(crate) struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl AgentProcess {
    pub(crate) fn spawn(command: &AgentCommand, prompt: &str) -> Result<Self> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args);
        // Allows running the agent from inside another agent session.
        cmd.env_remove("CLAUDECODE");
        for (k, v) in &command.env {
            cmd.env(k, v);
        }
        if let Some(dir) = &command.cwd {
            cmd.current_dir(dir);
        }
        Self::from_command(cmd, prompt).map_err(|e| match e {
            ClaudeAgentError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                ClaudeAgentError::NotInstalled(command.program.clone())
            }
            other => other,
        })
    }

    /// Spawn an arbitrary command in place of the agent. Used by tests.
    #[cfg(test)]
    pub(crate) fn spawn_command(cmd: Command, prompt: &str) -> Result<Self> {
        Self::from_command(cmd, prompt)
    }

    fn from_command(mut cmd: Command, prompt: &str) -> Result<Self> {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = prompt.to_owned();
            tokio::spawn(async move {
                // The agent may exit without reading its input.
                if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                    if e.kind() != std::io::ErrorKind::BrokenPipe {
                        tracing::warn!("failed to write agent prompt: {e}");
                    }
                }
            });
        }

        let stdout = child.stdout.take();
        let stdout_task = tokio::spawn(async move {
            let mut out = String::new();
            if let Some(stdout) = stdout {
                let mut reader = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    tracing::trace!(target: "agent", "{line}");
                    out.push_str(&line);
                    out.push('\n');
                }
            }
            out
        });

        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(stderr) = stderr {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    if !buf.is_empty() {
                        buf.push('\n');
                    }
                    buf.push_str(&line);
                }
            }
            buf
        });

        Ok(Self {
            child,
            stdout_task,
            stderr_task,
        })
    }

    /// Wait for exit and collect everything the process printed. Dropping
    /// the future kills the child.
    pub(crate) async fn wait(mut self) -> Result<ProcessOutput> {
        let status = self.child.wait().await?;
        let stdout = self.stdout_task.await.unwrap_or_default();
        let stderr = self.stderr_task.await.unwrap_or_default();
        Ok(ProcessOutput {
            status,
            stdout,
            stderr,
        })
    }
}
