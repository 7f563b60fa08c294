//! Infrastructure layer: job storage, execution, notifications and the
//! worker loop.

pub mod config;
pub mod jobs;
pub mod notify;
pub mod workers;

pub use config::{ConfigError, WorkerConfig, WorkerSettings};

#[cfg(test)]
mod integration_tests;
