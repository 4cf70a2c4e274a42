use anyhow::Context;
use ralph_core::{config::Config, execution::DEFAULT_PROMPT, io, paths, Store};
use std::path::Path;

pub fn run(root: &Path, name: Option<&str>) -> anyhow::Result<()> {
    let project_name = name.map(str::to_string).unwrap_or_else(|| {
        root.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string())
    });

    println!("Initializing Ralph in: {}", root.display());

    if paths::config_path(root).exists() {
        println!("  exists:  {}", paths::CONFIG_FILE);
    } else {
        Config::new(&project_name)
            .save(root)
            .context("failed to write config.yaml")?;
        println!("  created: {}", paths::CONFIG_FILE);
    }

    let db_existed = paths::db_path(root).exists();
    Store::open_project(root).context("failed to create the database")?;
    if db_existed {
        println!("  exists:  {}", paths::DB_FILE);
    } else {
        println!("  created: {}", paths::DB_FILE);
    }

    if io::write_if_missing(&paths::prompt_path(root), DEFAULT_PROMPT.as_bytes())? {
        println!("  created: {}", paths::PROMPT_FILE);
    } else {
        println!("  exists:  {}", paths::PROMPT_FILE);
    }

    println!("\nNext: `ralph import <prd.json>` then `ralph serve` or `ralph run`.");
    Ok(())
}
