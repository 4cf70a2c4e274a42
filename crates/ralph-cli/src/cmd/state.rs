use super::open_store;
use crate::output::{print_json, print_table};
use anyhow::Context;
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let store = open_store(root)?;
    let state = store.run_state().context("failed to load run state")?;
    let versions = store.list_versions()?;

    if json {
        return print_json(&serde_json::json!({
            "state": state,
            "versions": versions,
        }));
    }

    println!("Status:     {}", state.status);
    println!(
        "Story:      {}",
        state.current_story.as_deref().unwrap_or("-")
    );
    if state.current_story.is_some() {
        println!("Attempts:   {}", state.attempts);
    }
    println!(
        "Last done:  {}",
        state.last_completed.as_deref().unwrap_or("-")
    );
    if let Some(err) = &state.last_error {
        println!("Last error: {err} ({} in a row)", state.failure_count);
    }

    if versions.is_empty() {
        println!("\nNo PRD imported yet.");
        return Ok(());
    }

    println!();
    let rows = versions
        .iter()
        .map(|v| {
            let p = &v.progress;
            vec![
                v.version.id.clone(),
                v.version.title.clone(),
                p.total.to_string(),
                p.passed.to_string(),
                p.merged.to_string(),
                p.skipped.to_string(),
                format!("{}%", p.percentage),
            ]
        })
        .collect();
    print_table(
        &["VERSION", "TITLE", "TOTAL", "PASSED", "MERGED", "SKIPPED", "DONE"],
        rows,
    );
    Ok(())
}
