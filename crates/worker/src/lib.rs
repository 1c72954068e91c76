//! `workflowq-worker` — process wiring for the workflow dispatcher.

pub mod config;
pub mod handlers;

pub use config::{ConfigError, WorkerConfig};
