//! Claiming, sweeping and running single jobs.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use listingsync_core::JobId;
use listingsync_events::TenantScope;
use listingsync_jobs::{HandlerError, HandlerRegistry, Job, JobStatus, RetryPolicy};

use super::batch::BatchJobService;
use super::orchestrator::{TaskOrchestrator, TaskRunOutcome};
use super::store::{ClaimFilter, JobStore, StoreError, StoreResult, touched_batches};

/// Executor tunables.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Name for logging
    pub name: String,
    /// A RUNNING job claimed longer ago than this is presumed orphaned.
    pub job_timeout: Duration,
    /// Backoff applied to retryable failures.
    pub retry_policy: RetryPolicy,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            name: "job-executor".to_string(),
            job_timeout: Duration::from_secs(15 * 60),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl ExecutorSettings {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

/// What the pre-claim sweeps did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub stale_requeued: usize,
    pub stale_failed: usize,
    /// Stale children of a cancelled batch, cancelled instead of requeued.
    pub stale_cancelled: usize,
    pub released: u64,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.expired == 0
            && self.stale_requeued == 0
            && self.stale_failed == 0
            && self.stale_cancelled == 0
            && self.released == 0
    }
}

/// How one attempt ended, from the executor's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    /// Retryable failure with budget left; claimable again after backoff.
    Requeued { retry_count: u32 },
    Failed,
    /// The job, or its batch, was cancelled while the attempt ran.
    Cancelled,
    /// The claim was lost (stale sweep); the result was discarded.
    Superseded,
}

/// Claims jobs exclusively and runs them through their handlers.
pub struct JobExecutor<S: ?Sized> {
    store: Arc<S>,
    registry: HandlerRegistry,
    orchestrator: TaskOrchestrator<S>,
    batches: BatchJobService<S>,
    settings: ExecutorSettings,
}

impl<S> std::fmt::Debug for JobExecutor<S>
where
    S: ?Sized,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("registry", &self.registry)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl<S> JobExecutor<S>
where
    S: JobStore + ?Sized,
{
    pub fn new(store: Arc<S>, registry: HandlerRegistry, settings: ExecutorSettings) -> Self {
        Self {
            orchestrator: TaskOrchestrator::new(store.clone()),
            batches: BatchJobService::new(store.clone()),
            store,
            registry,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn batches(&self) -> &BatchJobService<S> {
        &self.batches
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Run the idempotent pre-claim sweeps: expire, stale, release.
    pub async fn run_sweeps(&self) -> StoreResult<SweepReport> {
        self.run_sweeps_at(Utc::now()).await
    }

    pub async fn run_sweeps_at(&self, now: DateTime<Utc>) -> StoreResult<SweepReport> {
        let mut report = SweepReport::default();

        let expired = self.store.expire_pending_jobs(now).await?;
        report.expired = expired.len();
        for job in &expired {
            info!(
                executor = %self.settings.name,
                job_id = %job.id,
                tenant_id = %job.tenant_id,
                "job expired before execution"
            );
        }

        let timeout = chrono::Duration::from_std(self.settings.job_timeout)
            .map_err(|e| StoreError::InvalidState(format!("job timeout out of range: {e}")))?;
        let stale_error = format!(
            "job exceeded timeout of {}s (worker presumed dead)",
            self.settings.job_timeout.as_secs()
        );
        let stale = self
            .store
            .sweep_stale_jobs(now - timeout, &stale_error, &self.settings.retry_policy, now)
            .await?;
        for job in &stale {
            match job.status {
                JobStatus::Failed => report.stale_failed += 1,
                JobStatus::Cancelled => report.stale_cancelled += 1,
                _ => report.stale_requeued += 1,
            }
            warn!(
                executor = %self.settings.name,
                job_id = %job.id,
                tenant_id = %job.tenant_id,
                retry_count = job.retry_count,
                status = %job.status,
                "reclaimed stale job"
            );
        }

        report.released = self.store.release_due_retries(now).await?;

        for batch_id in touched_batches(expired.iter().chain(stale.iter())) {
            self.batches.update_batch_progress(batch_id).await?;
        }

        if !report.is_empty() {
            debug!(executor = %self.settings.name, ?report, "sweeps finished");
        }
        Ok(report)
    }

    /// Claim the next eligible job, marking its batch as started.
    pub async fn claim_next_job(&self, filter: &ClaimFilter) -> StoreResult<Option<Job>> {
        let Some(job) = self.store.claim_next_job(filter, Utc::now()).await? else {
            return Ok(None);
        };
        if let Some(batch_id) = job.batch_id {
            self.store.mark_batch_started(batch_id, Utc::now()).await?;
        }
        debug!(
            executor = %self.settings.name,
            job_id = %job.id,
            tenant_id = %job.tenant_id,
            kind = %job.kind,
            retry_count = job.retry_count,
            "claimed job"
        );
        Ok(Some(job))
    }

    /// Run one claimed job to the end of this attempt and persist the result.
    pub async fn run_job(&self, job: Job) -> StoreResult<JobOutcome> {
        let Some(claim_id) = job.claim_id else {
            return Err(StoreError::InvalidState(format!(
                "job {} was not claimed",
                job.id
            )));
        };

        let attempt = match self.registry.resolve(&job.kind) {
            None => Attempt::Failed(HandlerError::non_retryable(format!(
                "no handler registered for {}",
                job.kind
            ))),
            Some(handler) => match handler.step_handlers() {
                Some(steps) => {
                    let report = self
                        .orchestrator
                        .execute_job_with_tasks(&job, handler.as_ref(), &steps)
                        .await?;
                    match report.outcome {
                        TaskRunOutcome::Succeeded { summary } => Attempt::Succeeded(summary),
                        TaskRunOutcome::Failed { error, .. } => Attempt::Failed(error),
                        TaskRunOutcome::Interrupted { status } => Attempt::Interrupted(status),
                    }
                }
                None => match handler.execute(&job).await {
                    Ok(result) => Attempt::Succeeded(result),
                    Err(error) => Attempt::Failed(error),
                },
            },
        };

        self.finish(job, claim_id, attempt).await
    }

    /// Sweep, claim one job and run it. `None` when nothing was claimable.
    pub async fn process_next(&self, filter: &ClaimFilter) -> StoreResult<Option<JobOutcome>> {
        self.run_sweeps().await?;
        match self.claim_next_job(filter).await? {
            Some(job) => Ok(Some(self.run_job(job).await?)),
            None => Ok(None),
        }
    }

    /// Operator cancellation of one job.
    ///
    /// A RUNNING job is cancelled cooperatively: its attempt finds out at the
    /// next step boundary or when it tries to persist its result.
    pub async fn cancel_job(&self, job_id: JobId, reason: &str) -> StoreResult<Job> {
        let job = self.store.cancel_job(job_id, reason, Utc::now()).await?;
        info!(executor = %self.settings.name, job_id = %job.id, reason, "job cancelled");
        if let Some(batch_id) = job.batch_id {
            self.batches.update_batch_progress(batch_id).await?;
        }
        Ok(job)
    }

    /// Cancel every PENDING / RETRY_PENDING job in `scope`. Running jobs are untouched.
    pub async fn cancel_unclaimed(&self, scope: TenantScope, reason: &str) -> StoreResult<Vec<Job>> {
        let cancelled = self
            .store
            .cancel_unclaimed_jobs(scope, reason, Utc::now())
            .await?;
        if !cancelled.is_empty() {
            info!(
                executor = %self.settings.name,
                scope = %scope,
                count = cancelled.len(),
                reason,
                "cancelled unclaimed jobs"
            );
        }
        for batch_id in touched_batches(&cancelled) {
            self.batches.update_batch_progress(batch_id).await?;
        }
        Ok(cancelled)
    }

    async fn finish(&self, mut job: Job, claim_id: uuid::Uuid, attempt: Attempt) -> StoreResult<JobOutcome> {
        let now = Utc::now();
        let outcome = match attempt {
            Attempt::Interrupted(status) => {
                info!(
                    executor = %self.settings.name,
                    job_id = %job.id,
                    status = %status,
                    "attempt interrupted; job no longer held"
                );
                return Ok(match status {
                    JobStatus::Cancelled => JobOutcome::Cancelled,
                    _ => JobOutcome::Superseded,
                });
            }
            Attempt::Succeeded(result) => {
                job.record_success(Some(result), now)?;
                JobOutcome::Succeeded
            }
            Attempt::Failed(error) => {
                let status = job.record_failure(
                    error.message(),
                    error.is_retryable(),
                    &self.settings.retry_policy,
                    now,
                )?;
                if status == JobStatus::RetryPending {
                    JobOutcome::Requeued {
                        retry_count: job.retry_count,
                    }
                } else {
                    JobOutcome::Failed
                }
            }
        };

        if !self.store.finish_job(&mut job, claim_id).await? {
            let current = self.store.get_job(job.id).await?;
            let status = current.map(|j| j.status);
            warn!(
                executor = %self.settings.name,
                job_id = %job.id,
                current_status = ?status,
                "claim lost before the result was saved; discarding"
            );
            return Ok(match status {
                Some(JobStatus::Cancelled) => JobOutcome::Cancelled,
                _ => JobOutcome::Superseded,
            });
        }

        // The store drops retries for children of a cancelled batch.
        let outcome = if job.status == JobStatus::Cancelled {
            JobOutcome::Cancelled
        } else {
            outcome
        };

        match &outcome {
            JobOutcome::Succeeded => info!(
                executor = %self.settings.name,
                job_id = %job.id,
                kind = %job.kind,
                retry_count = job.retry_count,
                "job succeeded"
            ),
            JobOutcome::Requeued { retry_count } => warn!(
                executor = %self.settings.name,
                job_id = %job.id,
                kind = %job.kind,
                retry_count,
                retry_at = ?job.retry_at,
                error = job.error_message.as_deref().unwrap_or_default(),
                "job failed; retry scheduled"
            ),
            JobOutcome::Cancelled => info!(
                executor = %self.settings.name,
                job_id = %job.id,
                batch_id = ?job.batch_id,
                error = job.error_message.as_deref().unwrap_or_default(),
                "job failed in a cancelled batch; retry dropped"
            ),
            _ => error!(
                executor = %self.settings.name,
                job_id = %job.id,
                kind = %job.kind,
                retry_count = job.retry_count,
                error = job.error_message.as_deref().unwrap_or_default(),
                "job failed"
            ),
        }

        if job.status.is_terminal() {
            if let Some(batch_id) = job.batch_id {
                self.batches.update_batch_progress(batch_id).await?;
            }
        }
        Ok(outcome)
    }
}

enum Attempt {
    Succeeded(serde_json::Value),
    Failed(HandlerError),
    Interrupted(JobStatus),
}
