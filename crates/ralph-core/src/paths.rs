use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const RALPH_DIR: &str = ".ralph";
pub const CONFIG_FILE: &str = ".ralph/config.yaml";
pub const DB_FILE: &str = ".ralph/ralph.db";
pub const PROMPT_FILE: &str = ".ralph/prompt.md";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn ralph_dir(root: &Path) -> PathBuf {
    root.join(RALPH_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn db_path(root: &Path) -> PathBuf {
    root.join(DB_FILE)
}

pub fn prompt_path(root: &Path) -> PathBuf {
    root.join(PROMPT_FILE)
}

pub fn is_initialized(root: &Path) -> bool {
    config_path(root).is_file()
}
