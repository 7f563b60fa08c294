//! Durable job execution: storage, claiming, multi-step orchestration and
//! batch aggregation.
//!
//! ## Components
//!
//! - `JobStore`: persistence (`InMemoryJobStore`, `PostgresJobStore`)
//! - `JobExecutor`: sweeps, exclusive claims, one attempt per claim
//! - `TaskOrchestrator`: resumable multi-step execution
//! - `BatchJobService`: batch creation, progress and cancellation
//! - `JobIntake`: in-process submission with optional wake-up notifications

pub mod batch;
pub mod executor;
pub mod intake;
pub mod orchestrator;
pub mod postgres;
pub mod store;

pub use batch::BatchJobService;
pub use executor::{ExecutorSettings, JobExecutor, JobOutcome, SweepReport};
pub use intake::JobIntake;
pub use orchestrator::{TaskOrchestrator, TaskRunOutcome, TaskRunReport};
pub use postgres::{MIGRATOR, PostgresJobStore, migrate};
pub use store::{
    ClaimFilter, InMemoryJobStore, JobStats, JobStore, StoreError, StoreResult, touched_batches,
};
