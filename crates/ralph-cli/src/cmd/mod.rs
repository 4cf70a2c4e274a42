pub mod handoff;
pub mod import;
pub mod init;
pub mod next;
pub mod reset;
pub mod run;
pub mod serve;
pub mod signal;
pub mod state;
pub mod story;
pub mod tasks;

use anyhow::Context;
use ralph_core::{paths, Store};
use std::path::Path;

/// Open the project database, failing with a hint when `init` has not run.
pub(crate) fn open_store(root: &Path) -> anyhow::Result<Store> {
    if !paths::is_initialized(root) {
        anyhow::bail!(
            "no Ralph project at {} (run `ralph init` first)",
            root.display()
        );
    }
    Store::open_project(root).context("failed to open .ralph/ralph.db")
}
