use super::open_store;
use crate::output::{print_json, print_table, truncate};
use ralph_core::scoring::score_stories;
use std::path::Path;

pub fn run(root: &Path, version: Option<&str>, json: bool) -> anyhow::Result<()> {
    let store = open_store(root)?;
    let state = store.run_state()?;
    let version = ralph_server::routes::run::resolve_version(&store, version, &state)?;
    let all = store.list_stories(None)?;
    let scored = score_stories(&all, &version, state.last_completed.as_deref());

    if json {
        return print_json(&serde_json::json!({
            "version": version,
            "scoredStories": scored,
        }));
    }

    if scored.is_empty() {
        println!("No runnable stories in {version}.");
        return Ok(());
    }

    let rows = scored
        .iter()
        .map(|s| {
            let b = &s.breakdown;
            vec![
                s.story_id.clone(),
                format!("{:.2}", s.score),
                format!(
                    "{:.1}/{:.2}/{:.1}/{:.1}/{:.2}",
                    b.proximity, b.tag_overlap, b.blocker_value, b.priority, b.simplicity
                ),
                truncate(&s.title, 50),
            ]
        })
        .collect();
    print_table(&["STORY", "SCORE", "PROX/TAGS/BLOCK/PRIO/SIMPLE", "TITLE"], rows);
    Ok(())
}
