use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClaudeAgentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("agent command '{0}' not found on PATH")]
    NotInstalled(String),

    #[error("agent timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("{}", exit_message(.code, .stderr))]
    Exit {
        code: Option<i32>,
        stderr: String,
        stdout: String,
    },

    #[error("Failed to parse stream-json line: {source}\n  line: {line}")]
    Parse {
        line: String,
        #[source]
        source: serde_json::Error,
    },
}

fn exit_message(code: &Option<i32>, stderr: &str) -> String {
    let head = match code {
        Some(code) => format!("agent process exited with code {code}"),
        None => "agent process terminated by signal".to_string(),
    };
    if stderr.is_empty() {
        head
    } else {
        format!("{head}\nstderr: {stderr}")
    }
}

impl ClaudeAgentError {
    /// Whatever the process printed before failing, for debugging.
    pub fn raw_output(&self) -> Option<&str> {
        match self {
            ClaudeAgentError::Exit { stdout, stderr, .. } => {
                if stdout.is_empty() {
                    Some(stderr)
                } else {
                    Some(stdout)
                }
            }
            _ => None,
        }
    }
}
