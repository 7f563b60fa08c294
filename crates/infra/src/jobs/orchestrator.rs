//! Resumable multi-step execution.
//!
//! A job's plan is persisted as tasks on its first attempt. Every later
//! attempt reuses that plan, skips steps that already succeeded, and stops at
//! the first failing step. Each step transition is written before the next
//! step starts, so a crash leaves an exact resumption point.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use listingsync_core::JobId;
use listingsync_jobs::{HandlerError, Job, JobHandler, JobStatus, StepHandlers, Task};

use super::store::{JobStore, StoreResult};

/// How an orchestrated attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskRunOutcome {
    /// Every step is SUCCESS; `summary` maps step description to its result.
    Succeeded { summary: serde_json::Value },
    /// A step failed (or the plan itself was unusable).
    Failed {
        position: Option<u32>,
        error: HandlerError,
    },
    /// The job stopped being ours between steps (cancelled or re-claimed).
    Interrupted { status: JobStatus },
}

/// Outcome plus the tasks as persisted at the end of the attempt.
#[derive(Debug, Clone)]
pub struct TaskRunReport {
    pub outcome: TaskRunOutcome,
    pub tasks: Vec<Task>,
}

impl TaskRunReport {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, TaskRunOutcome::Succeeded { .. })
    }
}

/// Runs a job's persisted plan step by step.
#[derive(Debug)]
pub struct TaskOrchestrator<S: ?Sized> {
    store: Arc<S>,
}

impl<S> TaskOrchestrator<S>
where
    S: JobStore + ?Sized,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Load the job's plan, creating it from the handler on the first attempt.
    ///
    /// `Ok(Err(_))` means the handler produced an unusable plan.
    pub async fn ensure_tasks(
        &self,
        job: &Job,
        handler: &dyn JobHandler,
    ) -> StoreResult<Result<Vec<Task>, HandlerError>> {
        let existing = self.store.list_tasks(job.id).await?;
        if !existing.is_empty() {
            return Ok(Ok(existing));
        }

        let steps = handler.create_tasks(job);
        if steps.is_empty() {
            return Ok(Err(HandlerError::non_retryable(
                "handler produced an empty task plan",
            )));
        }
        let plan = match Task::plan(job.id, &steps) {
            Ok(plan) => plan,
            Err(err) => return Ok(Err(HandlerError::non_retryable(err.to_string()))),
        };
        debug!(job_id = %job.id, steps = plan.len(), "created task plan");
        Ok(Ok(self.store.create_tasks(job.id, plan).await?))
    }

    /// Execute every step of `job` that has not yet succeeded, in position order.
    pub async fn execute_job_with_tasks(
        &self,
        job: &Job,
        handler: &dyn JobHandler,
        steps: &StepHandlers,
    ) -> StoreResult<TaskRunReport> {
        let mut tasks = match self.ensure_tasks(job, handler).await? {
            Ok(tasks) => tasks,
            Err(error) => {
                return Ok(TaskRunReport {
                    outcome: TaskRunOutcome::Failed {
                        position: None,
                        error,
                    },
                    tasks: Vec::new(),
                });
            }
        };
        tasks.sort_by_key(|t| t.position);

        let mut summary = serde_json::Map::new();
        let mut outcome = None;

        for task in tasks.iter_mut() {
            if !task.needs_run() {
                debug!(job_id = %job.id, position = task.position, "skipping completed task");
                if let Some(result) = &task.result {
                    summary.insert(task.description.clone(), result.clone());
                }
                continue;
            }

            if let Some(status) = self.interrupted(job).await? {
                outcome = Some(TaskRunOutcome::Interrupted { status });
                break;
            }

            let Some(step) = steps.get(&task.description) else {
                let error = HandlerError::non_retryable(format!(
                    "no step handler registered for '{}'",
                    task.description
                ));
                task.fail(error.message(), Utc::now());
                self.store.update_task(task).await?;
                outcome = Some(TaskRunOutcome::Failed {
                    position: Some(task.position),
                    error,
                });
                break;
            };

            task.start(Utc::now());
            self.store.update_task(task).await?;

            match step(job.clone()).await {
                Ok(result) => {
                    task.succeed(result.clone(), Utc::now());
                    self.store.update_task(task).await?;
                    summary.insert(task.description.clone(), result);
                }
                Err(error) => {
                    warn!(
                        job_id = %job.id,
                        position = task.position,
                        step = %task.description,
                        retryable = error.is_retryable(),
                        error = %error,
                        "task failed"
                    );
                    task.fail(error.message(), Utc::now());
                    self.store.update_task(task).await?;
                    outcome = Some(TaskRunOutcome::Failed {
                        position: Some(task.position),
                        error,
                    });
                    break;
                }
            }
        }

        let outcome = outcome.unwrap_or(TaskRunOutcome::Succeeded {
            summary: serde_json::Value::Object(summary),
        });
        Ok(TaskRunReport { outcome, tasks })
    }

    /// `Some(status)` when the job is no longer held by this attempt's claim.
    async fn interrupted(&self, job: &Job) -> StoreResult<Option<JobStatus>> {
        let Some(claim_id) = job.claim_id else {
            return Ok(None);
        };
        let current = self.store.get_job(job.id).await?;
        Ok(match current {
            Some(current) if current.is_held_by(claim_id) => None,
            Some(current) => Some(current.status),
            None => Some(JobStatus::Cancelled),
        })
    }

    pub async fn tasks(&self, job_id: JobId) -> StoreResult<Vec<Task>> {
        self.store.list_tasks(job_id).await
    }
}
