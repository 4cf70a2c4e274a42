pub mod checkpoint;
pub mod config;
pub mod db;
pub mod deps;
pub mod error;
pub mod execution;
pub mod handoff;
pub mod io;
pub mod metrics;
pub mod paths;
pub mod prd;
pub mod prompts;
pub mod run_state;
pub mod scoring;
pub mod signal;
pub mod story;
pub mod task;
pub mod types;

pub use db::Store;
pub use error::{RalphError, Result};
