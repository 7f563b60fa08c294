//! Job storage: the trait every backend implements, plus the in-memory
//! backend used by tests and single-process setups.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use listingsync_core::{BatchId, DomainError, JobId, TenantId};
use listingsync_events::TenantScope;
use listingsync_jobs::{Batch, BatchTally, Job, JobStatus, Marketplace, RetryPolicy, Task};

/// Store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),
    #[error("batch not found: {0}")]
    BatchNotFound(BatchId),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<DomainError> for StoreError {
    fn from(err: DomainError) -> Self {
        StoreError::InvalidState(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Which PENDING jobs a claim may pick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimFilter {
    pub scope: TenantScope,
    /// Tenants already at their concurrency bound in this worker.
    pub exclude_tenants: Vec<TenantId>,
    /// `None` means every marketplace.
    pub marketplaces: Option<Vec<Marketplace>>,
}

impl ClaimFilter {
    pub fn for_scope(scope: TenantScope) -> Self {
        Self {
            scope,
            ..Self::default()
        }
    }

    pub fn excluding(mut self, tenants: impl IntoIterator<Item = TenantId>) -> Self {
        self.exclude_tenants.extend(tenants);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.scope.includes(job.tenant_id)
            && !self.exclude_tenants.contains(&job.tenant_id)
            && self
                .marketplaces
                .as_ref()
                .is_none_or(|m| m.contains(&job.kind.marketplace))
    }
}

/// Job counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: u64,
    pub running: u64,
    pub success: u64,
    pub retry_pending: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus, count: u64) {
        let slot = match status {
            JobStatus::Pending => &mut self.pending,
            JobStatus::Running => &mut self.running,
            JobStatus::Success => &mut self.success,
            JobStatus::RetryPending => &mut self.retry_pending,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Cancelled => &mut self.cancelled,
        };
        *slot += count;
    }
}

/// Persistence for jobs, their tasks and batches.
///
/// Every method is safe to call from any number of workers at once. Claims and
/// sweeps never hand the same row to two callers; attempt-finishing writes
/// only land while the caller still holds the claim.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: Job) -> StoreResult<Job>;

    /// Insert a batch and all of its jobs atomically.
    async fn insert_batch(&self, batch: Batch, jobs: Vec<Job>) -> StoreResult<(Batch, Vec<Job>)>;

    async fn get_job(&self, job_id: JobId) -> StoreResult<Option<Job>>;

    async fn get_batch(&self, batch_id: BatchId) -> StoreResult<Option<Batch>>;

    async fn list_batch_jobs(&self, batch_id: BatchId) -> StoreResult<Vec<Job>>;

    /// Atomically move the most urgent eligible PENDING job to RUNNING.
    ///
    /// Eligible: PENDING, unexpired, batch not cancelled, matching `filter`.
    /// Ordered by (priority asc, created_at asc).
    async fn claim_next_job(&self, filter: &ClaimFilter, now: DateTime<Utc>)
    -> StoreResult<Option<Job>>;

    /// Cancel PENDING jobs whose expiry has passed. Returns the swept jobs.
    async fn expire_pending_jobs(&self, now: DateTime<Utc>) -> StoreResult<Vec<Job>>;

    /// Fail RUNNING jobs claimed before `cutoff` as a retryable failure.
    ///
    /// A requeue of a child whose batch is CANCELLED becomes CANCELLED instead.
    async fn sweep_stale_jobs(
        &self,
        cutoff: DateTime<Utc>,
        error: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Job>>;

    /// Requeue RETRY_PENDING jobs whose backoff has elapsed.
    async fn release_due_retries(&self, now: DateTime<Utc>) -> StoreResult<u64>;

    /// Persist the end of an attempt if `claim_id` still holds the job.
    ///
    /// A retry for a child of a CANCELLED batch is written as CANCELLED and
    /// `job` is updated to match. Returns `false` when the claim was lost
    /// (swept as stale, cancelled).
    async fn finish_job(&self, job: &mut Job, claim_id: Uuid) -> StoreResult<bool>;

    /// Cancel one non-terminal job.
    async fn cancel_job(&self, job_id: JobId, reason: &str, now: DateTime<Utc>) -> StoreResult<Job>;

    /// Cancel every PENDING / RETRY_PENDING job in `scope`.
    async fn cancel_unclaimed_jobs(
        &self,
        scope: TenantScope,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Job>>;

    /// Persist a job's plan. Idempotent: an existing plan is returned as is.
    async fn create_tasks(&self, job_id: JobId, tasks: Vec<Task>) -> StoreResult<Vec<Task>>;

    /// A job's tasks in position order.
    async fn list_tasks(&self, job_id: JobId) -> StoreResult<Vec<Task>>;

    async fn update_task(&self, task: &Task) -> StoreResult<()>;

    /// PENDING → RUNNING for the batch. Returns whether it changed.
    async fn mark_batch_started(&self, batch_id: BatchId, now: DateTime<Utc>) -> StoreResult<bool>;

    /// Recount children under the batch lock and settle the batch status.
    async fn recompute_batch(&self, batch_id: BatchId, now: DateTime<Utc>) -> StoreResult<Batch>;

    /// Cancel an active batch and its unclaimed children.
    async fn cancel_batch(
        &self,
        batch_id: BatchId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<(Batch, Vec<Job>)>;

    async fn stats(&self, scope: TenantScope) -> StoreResult<JobStats>;
}

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    tasks: HashMap<JobId, Vec<Task>>,
    batches: HashMap<BatchId, Batch>,
}

impl State {
    fn batch_cancelled(&self, job: &Job) -> bool {
        job.batch_id
            .and_then(|id| self.batches.get(&id))
            .is_some_and(|b| b.status == listingsync_jobs::BatchStatus::Cancelled)
    }

    fn cancelled_batches(&self) -> HashSet<BatchId> {
        self.batches
            .values()
            .filter(|b| b.status == listingsync_jobs::BatchStatus::Cancelled)
            .map(|b| b.batch_id)
            .collect()
    }
}

/// In-memory job store for tests/dev.
///
/// One lock guards all state, so every operation is atomic.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: Mutex<State>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> StoreResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| StoreError::Storage("in-memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert_job(&self, job: Job) -> StoreResult<Job> {
        let mut state = self.state()?;
        if state.jobs.contains_key(&job.id) {
            return Err(StoreError::Conflict(format!("job {} already exists", job.id)));
        }
        if let Some(batch_id) = job.batch_id {
            if !state.batches.contains_key(&batch_id) {
                return Err(StoreError::BatchNotFound(batch_id));
            }
        }
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn insert_batch(&self, batch: Batch, jobs: Vec<Job>) -> StoreResult<(Batch, Vec<Job>)> {
        let mut state = self.state()?;
        if state.batches.contains_key(&batch.batch_id) {
            return Err(StoreError::Conflict(format!(
                "batch {} already exists",
                batch.batch_id
            )));
        }
        if let Some(dup) = jobs.iter().find(|j| state.jobs.contains_key(&j.id)) {
            return Err(StoreError::Conflict(format!("job {} already exists", dup.id)));
        }
        state.batches.insert(batch.batch_id, batch.clone());
        for job in &jobs {
            state.jobs.insert(job.id, job.clone());
        }
        Ok((batch, jobs))
    }

    async fn get_job(&self, job_id: JobId) -> StoreResult<Option<Job>> {
        Ok(self.state()?.jobs.get(&job_id).cloned())
    }

    async fn get_batch(&self, batch_id: BatchId) -> StoreResult<Option<Batch>> {
        Ok(self.state()?.batches.get(&batch_id).cloned())
    }

    async fn list_batch_jobs(&self, batch_id: BatchId) -> StoreResult<Vec<Job>> {
        let state = self.state()?;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.batch_id == Some(batch_id))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        Ok(jobs)
    }

    async fn claim_next_job(
        &self,
        filter: &ClaimFilter,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Job>> {
        let mut state = self.state()?;

        let next = state
            .jobs
            .values()
            .filter(|j| j.is_claimable(now) && filter.matches(j) && !state.batch_cancelled(j))
            .min_by_key(|j| (j.priority, j.created_at, j.id))
            .map(|j| j.id);

        let Some(job_id) = next else {
            return Ok(None);
        };
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        job.claim(Uuid::new_v4(), now)?;
        Ok(Some(job.clone()))
    }

    async fn expire_pending_jobs(&self, now: DateTime<Utc>) -> StoreResult<Vec<Job>> {
        let mut state = self.state()?;
        let mut expired = Vec::new();
        for job in state.jobs.values_mut().filter(|j| j.is_expired(now)) {
            job.expire(now)?;
            expired.push(job.clone());
        }
        Ok(expired)
    }

    async fn sweep_stale_jobs(
        &self,
        cutoff: DateTime<Utc>,
        error: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Job>> {
        let mut state = self.state()?;
        let cancelled = state.cancelled_batches();
        let mut swept = Vec::new();
        for job in state.jobs.values_mut().filter(|j| j.is_stale(cutoff)) {
            job.record_failure(error, true, policy, now)?;
            if job.batch_id.is_some_and(|id| cancelled.contains(&id)) {
                job.abandon_retry(now);
            }
            swept.push(job.clone());
        }
        Ok(swept)
    }

    async fn release_due_retries(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut state = self.state()?;
        let mut released = 0;
        for job in state.jobs.values_mut().filter(|j| j.is_retry_due(now)) {
            job.release_retry(now)?;
            released += 1;
        }
        Ok(released)
    }

    async fn finish_job(&self, job: &mut Job, claim_id: Uuid) -> StoreResult<bool> {
        let mut state = self.state()?;
        let held = state
            .jobs
            .get(&job.id)
            .ok_or(StoreError::JobNotFound(job.id))?
            .is_held_by(claim_id);
        if !held {
            return Ok(false);
        }
        if state.batch_cancelled(job) {
            job.abandon_retry(job.updated_at);
        }
        state.jobs.insert(job.id, job.clone());
        Ok(true)
    }

    async fn cancel_job(&self, job_id: JobId, reason: &str, now: DateTime<Utc>) -> StoreResult<Job> {
        let mut state = self.state()?;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        job.cancel(reason, now)?;
        Ok(job.clone())
    }

    async fn cancel_unclaimed_jobs(
        &self,
        scope: TenantScope,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Job>> {
        let mut state = self.state()?;
        let mut cancelled = Vec::new();
        for job in state.jobs.values_mut().filter(|j| {
            matches!(j.status, JobStatus::Pending | JobStatus::RetryPending)
                && scope.includes(j.tenant_id)
        }) {
            job.cancel(reason, now)?;
            cancelled.push(job.clone());
        }
        Ok(cancelled)
    }

    async fn create_tasks(&self, job_id: JobId, tasks: Vec<Task>) -> StoreResult<Vec<Task>> {
        let mut state = self.state()?;
        if !state.jobs.contains_key(&job_id) {
            return Err(StoreError::JobNotFound(job_id));
        }
        let existing = state.tasks.entry(job_id).or_default();
        if existing.is_empty() {
            existing.extend(tasks);
            existing.sort_by_key(|t| t.position);
        }
        Ok(existing.clone())
    }

    async fn list_tasks(&self, job_id: JobId) -> StoreResult<Vec<Task>> {
        Ok(self
            .state()?
            .tasks
            .get(&job_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn update_task(&self, task: &Task) -> StoreResult<()> {
        let mut state = self.state()?;
        let slot = state
            .tasks
            .get_mut(&task.job_id)
            .and_then(|tasks| tasks.iter_mut().find(|t| t.id == task.id))
            .ok_or_else(|| StoreError::InvalidState(format!("task {} not found", task.id)))?;
        *slot = task.clone();
        Ok(())
    }

    async fn mark_batch_started(&self, batch_id: BatchId, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut state = self.state()?;
        let batch = state
            .batches
            .get_mut(&batch_id)
            .ok_or(StoreError::BatchNotFound(batch_id))?;
        Ok(batch.mark_started(now))
    }

    async fn recompute_batch(&self, batch_id: BatchId, now: DateTime<Utc>) -> StoreResult<Batch> {
        let mut state = self.state()?;
        let tally = BatchTally::from_statuses(
            state
                .jobs
                .values()
                .filter(|j| j.batch_id == Some(batch_id))
                .map(|j| j.status),
        );
        let batch = state
            .batches
            .get_mut(&batch_id)
            .ok_or(StoreError::BatchNotFound(batch_id))?;
        batch.apply_tally(tally, now);
        Ok(batch.clone())
    }

    async fn cancel_batch(
        &self,
        batch_id: BatchId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<(Batch, Vec<Job>)> {
        let mut state = self.state()?;
        let batch = state
            .batches
            .get_mut(&batch_id)
            .ok_or(StoreError::BatchNotFound(batch_id))?;
        batch.cancel(now)?;
        let batch = batch.clone();

        let mut cancelled = Vec::new();
        for job in state.jobs.values_mut().filter(|j| {
            j.batch_id == Some(batch_id)
                && matches!(j.status, JobStatus::Pending | JobStatus::RetryPending)
        }) {
            job.cancel(reason, now)?;
            cancelled.push(job.clone());
        }
        Ok((batch, cancelled))
    }

    async fn stats(&self, scope: TenantScope) -> StoreResult<JobStats> {
        let state = self.state()?;
        let mut stats = JobStats::default();
        for job in state.jobs.values().filter(|j| scope.includes(j.tenant_id)) {
            stats.record(job.status, 1);
        }
        Ok(stats)
    }
}

/// Distinct batch ids touched by `jobs`, in a stable order.
pub fn touched_batches<'a>(jobs: impl IntoIterator<Item = &'a Job>) -> Vec<BatchId> {
    jobs.into_iter()
        .filter_map(|j| j.batch_id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
