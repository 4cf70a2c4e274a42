pub mod events;
pub mod handoffs;
pub mod metrics;
pub mod prd;
pub mod run;
pub mod signal;
pub mod state;
pub mod story;
pub mod tasks;
pub mod versions;
