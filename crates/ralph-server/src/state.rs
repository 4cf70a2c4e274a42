use claude_agent::AgentCommand;
use ralph_core::config::Config;
use ralph_core::Store;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, Notify};

use crate::error::AppError;

/// Kinds of frames pushed over `/api/events`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunState,
    StoryUpdate,
    Metrics,
    TaskUpdate,
    Handoff,
    Gate,
    Log,
}

/// One `{type, data}` frame on the event stream.
#[derive(Debug, Clone, Serialize)]
pub struct SseMessage {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: serde_json::Value,
}

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub root: PathBuf,
    pub config: Arc<Config>,
    /// Port the server is reachable on; the agent posts signals here.
    pub port: u16,
    pub event_tx: broadcast::Sender<SseMessage>,
    /// Held for the whole of a `start`/`continue` request.
    pub run_lock: Arc<Mutex<()>>,
    /// Raised by `stop`, checked between iterations.
    pub stop_requested: Arc<AtomicBool>,
    /// Wakes the task worker when work is queued.
    pub task_notify: Arc<Notify>,
}

impl AppState {
    /// Load the project under `root`. Fails with `NotInitialized` when there
    /// is no `.ralph/config.yaml`.
    pub fn new(root: PathBuf) -> ralph_core::Result<Self> {
        Self::build(root, None, true)
    }

    /// Like [`AppState::new`], but agents are told to signal on `port`
    /// instead of the configured one.
    pub fn on_port(root: PathBuf, port: u16) -> ralph_core::Result<Self> {
        Self::build(root, Some(port), true)
    }

    /// State for a one-off run outside the server: no task worker.
    pub fn standalone(root: PathBuf) -> ralph_core::Result<Self> {
        Self::build(root, None, false)
    }

    fn build(root: PathBuf, port: Option<u16>, worker: bool) -> ralph_core::Result<Self> {
        let config = Config::load(&root)?;
        // Create and migrate the database before the first request needs it.
        Store::open_project(&root)?;

        let (tx, _) = broadcast::channel(256);
        let state = Self {
            port: port.unwrap_or(config.server.port),
            root,
            config: Arc::new(config),
            event_tx: tx,
            run_lock: Arc::new(Mutex::new(())),
            stop_requested: Arc::new(AtomicBool::new(false)),
            task_notify: Arc::new(Notify::new()),
        };

        // Guard: only spawn if inside a Tokio runtime (skipped in sync unit tests).
        if worker && tokio::runtime::Handle::try_current().is_ok() {
            tokio::spawn(crate::worker::run_worker(state.clone()));
        }

        Ok(state)
    }

    pub fn signal_url(&self) -> String {
        format!("http://localhost:{}/api/signal", self.port)
    }

    /// The configured agent command, run from the project root.
    pub fn agent_command(&self) -> AgentCommand {
        AgentCommand::new(&self.config.agent.command, self.config.agent.args.clone())
            .current_dir(&self.root)
            .env("RALPH_SIGNAL_URL", self.signal_url())
    }

    /// Broadcast an event. Having no subscribers is not an error.
    pub fn emit(&self, kind: EventKind, data: impl Serialize) {
        let data = serde_json::to_value(data).unwrap_or(serde_json::Value::Null);
        let _ = self.event_tx.send(SseMessage { kind, data });
    }

    /// Run `f` against a freshly opened store on the blocking pool.
    pub async fn blocking<T, F>(&self, f: F) -> Result<T, AppError>
    where
        F: FnOnce(&Store) -> ralph_core::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let root = self.root.clone();
        let result = tokio::task::spawn_blocking(move || {
            let store = Store::open_project(&root)?;
            f(&store)
        })
        .await
        .map_err(|e| AppError(anyhow::anyhow!("task join error: {e}")))??;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init(dir: &tempfile::TempDir) {
        Config::new("test-project").save(dir.path()).unwrap();
    }

    #[test]
    fn new_state_loads_config() {
        let dir = tempfile::TempDir::new().unwrap();
        init(&dir);
        let state = AppState::new(dir.path().to_path_buf()).unwrap();
        assert_eq!(state.root, dir.path());
        assert_eq!(state.port, 3141);
        assert!(ralph_core::paths::db_path(dir.path()).exists());
    }

    #[test]
    fn uninitialized_root_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = AppState::new(dir.path().to_path_buf()).err().unwrap();
        assert!(matches!(err, ralph_core::RalphError::NotInitialized));
    }

    #[test]
    fn signal_url_follows_port() {
        let dir = tempfile::TempDir::new().unwrap();
        init(&dir);
        let state = AppState::on_port(dir.path().to_path_buf(), 4000).unwrap();
        assert_eq!(state.signal_url(), "http://localhost:4000/api/signal");
    }

    #[test]
    fn emit_reaches_subscribers() {
        let dir = tempfile::TempDir::new().unwrap();
        init(&dir);
        let state = AppState::new(dir.path().to_path_buf()).unwrap();
        let mut rx = state.event_tx.subscribe();
        state.emit(EventKind::Log, serde_json::json!({ "message": "hi" }));
        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.kind, EventKind::Log);
        assert_eq!(
            serde_json::to_value(&msg).unwrap()["type"],
            serde_json::json!("log")
        );
    }
}
