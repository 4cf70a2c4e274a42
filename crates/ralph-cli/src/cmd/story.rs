use super::open_store;
use crate::output::{print_json, print_table};
use std::path::Path;

pub fn run(root: &Path, id: &str, json: bool) -> anyhow::Result<()> {
    let store = open_store(root)?;
    let story = store.get_story(id)?;
    let state = store.run_state()?;
    let all = store.list_stories(None)?;
    let status = story.status(state.current_story.as_deref());
    let unmet: Vec<&str> = story.unmet_dependencies(&all);
    let checkpoints = store.checkpoints_for(&story.id)?;
    let handoffs = store.handoff_state(&story.id)?;
    let log = store.execution_log_for(&story.id)?;

    if json {
        return print_json(&serde_json::json!({
            "status": status,
            "checkpoints": checkpoints,
            "handoffs": handoffs,
            "executionLog": log,
            "unmetDependencies": unmet,
            "story": story,
        }));
    }

    println!("{} [{}] {}", story.id, status, story.title);
    if let Some(intent) = &story.intent {
        println!("Intent: {intent}");
    }
    if let Some(desc) = &story.description {
        println!("\n{desc}");
    }
    if !story.acceptance.is_empty() {
        println!("\nAcceptance:");
        for ac in &story.acceptance {
            println!("  - {ac}");
        }
    }
    if !story.depends_on.is_empty() {
        println!("\nDepends on: {}", story.depends_on.join(", "));
        if !unmet.is_empty() {
            println!("  unmet: {}", unmet.join(", "));
        }
    }
    if let Some(reason) = &story.skip_reason {
        println!("\nSkipped: {reason}");
    }
    if let Some(url) = &story.pr_url {
        println!("PR: {url}");
    }

    println!("\nPipeline: {} ({})", handoffs.current_agent, handoffs.phase.as_str());

    if !checkpoints.is_empty() {
        println!("\nCheckpoints:");
        let rows = checkpoints
            .iter()
            .map(|c| vec![c.stage.to_string(), c.created_at.to_rfc3339()])
            .collect();
        print_table(&["STAGE", "AT"], rows);
    }

    if !log.is_empty() {
        println!("\nExecution log:");
        let rows = log
            .iter()
            .map(|e| {
                vec![
                    e.attempt.to_string(),
                    e.status.to_string(),
                    e.duration_seconds
                        .map(|d| format!("{d:.0}s"))
                        .unwrap_or_else(|| "-".into()),
                    e.error_message.clone().unwrap_or_default(),
                ]
            })
            .collect();
        print_table(&["ATTEMPT", "STATUS", "DURATION", "ERROR"], rows);
    }
    Ok(())
}
