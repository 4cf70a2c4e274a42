//! `claude-agent`: runs the agent CLI as a one-shot subprocess.
//!
//! ```text
//! RunConfig { command, prompt, timeout }
//!     │
//!     ▼
//! AgentProcess   ← spawns the command, writes the prompt to stdin,
//!     │             drains stdout/stderr in background tasks
//!     ▼
//! RunResult      ← raw streams plus the text extracted from
//!                  `--output-format stream-json` when present
//! ```

pub mod error;
pub mod runner;
pub mod types;

pub(crate) mod process;

pub use error::ClaudeAgentError;
pub use runner::{extract_json, extract_result_text, run, AgentCommand, RunConfig, RunResult};
pub use types::{ResultLine, StreamLine};

/// Convenience `Result` alias for this crate.
pub type Result<T> = std::result::Result<T, ClaudeAgentError>;
