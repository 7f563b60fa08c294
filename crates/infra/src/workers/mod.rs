//! Long-running worker processes.

pub mod job_worker;

pub use job_worker::{ExitReason, Worker, WorkerExit, WorkerHandle, WorkerState};
