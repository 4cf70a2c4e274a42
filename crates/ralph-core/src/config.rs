use crate::error::{RalphError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    3141
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

/// Defaults for an execution run; every field can be overridden per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionDefaults {
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_claude_timeout")]
    pub claude_timeout_secs: u64,
    #[serde(default)]
    pub auto_mode: bool,
    /// Identical failures in a row before auto mode stops for a human.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_stale_minutes")]
    pub stale_handoff_minutes: i64,
}

fn default_base_branch() -> String {
    "dev".into()
}

fn default_max_iterations() -> u32 {
    100
}

fn default_claude_timeout() -> u64 {
    900
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_stale_minutes() -> i64 {
    30
}

impl Default for ExecutionDefaults {
    fn default() -> Self {
        Self {
            base_branch: default_base_branch(),
            max_iterations: default_max_iterations(),
            claude_timeout_secs: default_claude_timeout(),
            auto_mode: false,
            failure_threshold: default_failure_threshold(),
            stale_handoff_minutes: default_stale_minutes(),
        }
    }
}

/// The external agent: a command that reads its prompt on stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_command")]
    pub command: String,
    #[serde(default = "default_agent_args")]
    pub args: Vec<String>,
}

fn default_agent_command() -> String {
    "claude".into()
}

fn default_agent_args() -> Vec<String> {
    vec!["--dangerously-skip-permissions".into(), "--print".into()]
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            args: default_agent_args(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VcsConfig {
    /// When off, branches are only recorded and no PRs are opened.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_remote")]
    pub remote: String,
}

fn default_true() -> bool {
    true
}

fn default_remote() -> String {
    "origin".into()
}

impl Default for VcsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            remote: default_remote(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub version: u32,
    pub project: ProjectConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub execution: ExecutionDefaults,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub vcs: VcsConfig,
}

impl Config {
    pub fn new(project_name: impl Into<String>) -> Self {
        Self {
            version: 1,
            project: ProjectConfig {
                name: project_name.into(),
            },
            server: ServerConfig::default(),
            execution: ExecutionDefaults::default(),
            agent: AgentConfig::default(),
            vcs: VcsConfig::default(),
        }
    }

    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(RalphError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.command.trim().is_empty() {
            return Err(RalphError::invalid_field("agent.command", "must not be empty"));
        }
        if self.execution.failure_threshold == 0 {
            return Err(RalphError::invalid_field(
                "execution.failure_threshold",
                "must be at least 1",
            ));
        }
        if self.execution.claude_timeout_secs == 0 {
            return Err(RalphError::invalid_field(
                "execution.claude_timeout_secs",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}
