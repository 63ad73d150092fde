pub mod common;
pub mod completions;
pub mod config;
pub mod events;
pub mod history;
pub mod queue;
pub mod status;
pub mod sync;
pub mod types;
