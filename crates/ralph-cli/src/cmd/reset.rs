use super::open_store;
use crate::output::print_json;
use ralph_core::config::Config;
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root)?;
    let store = open_store(root)?;
    let swept = store.sweep_stale_handoffs(config.execution.stale_handoff_minutes)?;
    let state = store.reset_state()?;

    if json {
        return print_json(&serde_json::json!({
            "state": state,
            "timedOutHandoffs": swept.len(),
        }));
    }

    println!("Run state reset (status: {}).", state.status);
    if !swept.is_empty() {
        println!("Timed out {} stale handoff(s).", swept.len());
    }
    Ok(())
}
