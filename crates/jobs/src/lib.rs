//! `listingsync-jobs`: the marketplace job model.
//!
//! Pure domain types: jobs, their ordered tasks, batches, the status
//! vocabularies, retry backoff, and the handler contract that integrations
//! implement. Every state transition takes `now` explicitly so the rules can
//! be exercised without a clock or a database.
//!
//! ## Components
//!
//! - [`Job`]: one unit of work for one marketplace, product and action
//! - [`Task`]: one ordered step of a job's execution plan
//! - [`Batch`]: aggregate progress over jobs created together
//! - [`RetryPolicy`]: when a retryable failure becomes claimable again
//! - [`JobHandler`] / [`HandlerRegistry`]: per-(marketplace, action) execution

pub mod batch;
pub mod handler;
pub mod job;
pub mod kind;
pub mod retry;
pub mod status;
pub mod task;

pub use batch::{Batch, BatchProgress, BatchTally};
pub use handler::{HandlerError, HandlerRegistry, JobHandler, StepFn, StepFuture, StepHandlers};
pub use job::{BATCH_CANCELLED_MESSAGE, DEFAULT_JOB_TTL, EXPIRED_MESSAGE, Job, NewJob};
pub use kind::{ActionCode, JobKind, Marketplace};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use status::{BatchStatus, JobStatus, TaskStatus};
pub use task::Task;
