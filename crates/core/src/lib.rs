//! `listingsync-core`: shared identifiers and the domain error model.
//!
//! This crate stays free of infrastructure concerns so every other crate in
//! the workspace can depend on it.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{BatchId, JobId, TaskId, TenantId};
