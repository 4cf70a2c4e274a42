use super::open_store;
use crate::output::print_json;
use anyhow::Context;
use ralph_core::prd::PrdDocument;
use std::path::Path;

pub fn run(root: &Path, file: &Path, json: bool) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let doc = parse(file, &text)?;

    let summary = open_store(root)?.import_prd(doc)?;
    tracing::info!(version = %summary.version, "PRD imported");

    if json {
        return print_json(&summary);
    }
    println!(
        "Imported {}: {} created, {} updated",
        summary.version,
        summary.created.len(),
        summary.updated.len()
    );
    Ok(())
}

/// YAML for `.yaml`/`.yml` files, JSON otherwise.
fn parse(file: &Path, text: &str) -> anyhow::Result<PrdDocument> {
    match file.extension().and_then(|e| e.to_str()) {
        Some("yaml" | "yml") => {
            serde_yaml::from_str(text).with_context(|| format!("invalid PRD in {}", file.display()))
        }
        _ => serde_json::from_str(text).with_context(|| format!("invalid PRD in {}", file.display())),
    }
}
