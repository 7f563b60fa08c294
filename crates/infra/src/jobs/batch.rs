//! Batch creation and progress aggregation.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use listingsync_core::{BatchId, DomainError, TenantId};
use listingsync_jobs::{Batch, BatchProgress, Job, JobKind, NewJob};

use super::store::{JobStore, StoreError, StoreResult};

/// Aggregates a batch's children into one progress/status view.
pub struct BatchJobService<S: ?Sized> {
    store: Arc<S>,
}

impl<S> BatchJobService<S>
where
    S: JobStore + ?Sized,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Create a batch plus one child job per entry, atomically.
    ///
    /// Every child must belong to `tenant_id` and carry `kind`.
    pub async fn create_batch(
        &self,
        tenant_id: TenantId,
        kind: JobKind,
        jobs: Vec<NewJob>,
    ) -> StoreResult<(Batch, Vec<Job>)> {
        let now = Utc::now();
        let total = u32::try_from(jobs.len())
            .map_err(|_| DomainError::validation("too many jobs for one batch"))?;
        let batch = Batch::new(tenant_id, kind, total, now)?;

        let mut children = Vec::with_capacity(jobs.len());
        for new in jobs {
            if new.tenant_id != tenant_id {
                return Err(DomainError::validation(format!(
                    "job for product {} belongs to another tenant",
                    new.product_id
                ))
                .into());
            }
            if new.kind != kind {
                return Err(DomainError::validation(format!(
                    "job for product {} is {}, batch is {kind}",
                    new.product_id, new.kind
                ))
                .into());
            }
            children.push(Job::new(new, now)?.in_batch(batch.batch_id));
        }

        let (batch, children) = self.store.insert_batch(batch, children).await?;
        info!(
            batch_id = %batch.batch_id,
            tenant_id = %batch.tenant_id,
            kind = %batch.kind,
            total = batch.total_count,
            "batch created"
        );
        Ok((batch, children))
    }

    /// Recount the batch's children and settle its status.
    pub async fn update_batch_progress(&self, batch_id: BatchId) -> StoreResult<Batch> {
        let batch = self.store.recompute_batch(batch_id, Utc::now()).await?;
        debug!(
            batch_id = %batch.batch_id,
            status = %batch.status,
            completed = batch.completed_count,
            failed = batch.failed_count,
            cancelled = batch.cancelled_count,
            pending = batch.pending_count(),
            "batch progress updated"
        );
        if batch.is_terminal() && batch.pending_count() == 0 {
            info!(batch_id = %batch.batch_id, status = %batch.status, "batch finished");
        }
        Ok(batch)
    }

    /// PENDING → RUNNING. Returns whether anything changed.
    pub async fn mark_started(&self, batch_id: BatchId) -> StoreResult<bool> {
        self.store.mark_batch_started(batch_id, Utc::now()).await
    }

    pub async fn get_progress(&self, batch_id: BatchId) -> StoreResult<BatchProgress> {
        self.store
            .get_batch(batch_id)
            .await?
            .map(|b| b.progress())
            .ok_or(StoreError::BatchNotFound(batch_id))
    }

    /// Cancel an active batch and its unclaimed children.
    ///
    /// Children already RUNNING finish their attempt; their results still
    /// count, but the batch stays CANCELLED.
    pub async fn cancel_batch(&self, batch_id: BatchId, reason: &str) -> StoreResult<Batch> {
        let now = Utc::now();
        let (_, cancelled) = self.store.cancel_batch(batch_id, reason, now).await?;
        let batch = self.store.recompute_batch(batch_id, now).await?;
        info!(
            batch_id = %batch_id,
            cancelled_jobs = cancelled.len(),
            reason,
            "batch cancelled"
        );
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::jobs::executor::{ExecutorSettings, JobExecutor, JobOutcome};
    use crate::jobs::store::{ClaimFilter, InMemoryJobStore};
    use listingsync_jobs::{
        ActionCode, BatchStatus, HandlerError, HandlerRegistry, JobHandler, JobStatus,
        Marketplace, RetryPolicy,
    };

    fn publish() -> JobKind {
        JobKind::new(Marketplace::Etsy, ActionCode::Publish)
    }

    fn new_jobs(tenant: TenantId, products: &[&str]) -> Vec<NewJob> {
        products
            .iter()
            .map(|p| NewJob::new(tenant, publish(), *p).with_max_retries(0))
            .collect()
    }

    /// Rejects any product whose id starts with "bad".
    struct PickyPublish {
        calls: AtomicU32,
    }

    #[async_trait]
    impl JobHandler for PickyPublish {
        async fn execute(&self, job: &Job) -> Result<serde_json::Value, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if job.product_id.starts_with("bad") {
                return Err(HandlerError::non_retryable("listing rejected"));
            }
            Ok(serde_json::json!({ "ok": true }))
        }
    }

    fn setup() -> (Arc<InMemoryJobStore>, JobExecutor<InMemoryJobStore>) {
        let store = Arc::new(InMemoryJobStore::new());
        let registry = HandlerRegistry::new().with(
            publish(),
            PickyPublish {
                calls: AtomicU32::new(0),
            },
        );
        let settings = ExecutorSettings::default().with_retry_policy(RetryPolicy::immediate());
        (store.clone(), JobExecutor::new(store, registry, settings))
    }

    async fn drain(executor: &JobExecutor<InMemoryJobStore>) -> Vec<JobOutcome> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = executor.process_next(&ClaimFilter::default()).await.unwrap() {
            outcomes.push(outcome);
        }
        outcomes
    }

    #[tokio::test]
    async fn create_batch_rejects_mixed_kinds_and_empty_input() {
        let (_, executor) = setup();
        let tenant = TenantId::new();
        let service = executor.batches();

        let err = service.create_batch(tenant, publish(), Vec::new()).await;
        assert!(matches!(err, Err(StoreError::InvalidState(_))));

        let mut jobs = new_jobs(tenant, &["a"]);
        jobs.push(NewJob::new(
            tenant,
            JobKind::new(Marketplace::Etsy, ActionCode::Delete),
            "b",
        ));
        let err = service.create_batch(tenant, publish(), jobs).await;
        assert!(matches!(err, Err(StoreError::InvalidState(_))));

        let foreign = new_jobs(TenantId::new(), &["c"]);
        assert!(service.create_batch(tenant, publish(), foreign).await.is_err());
    }

    #[tokio::test]
    async fn batch_with_failures_is_partially_failed() {
        let (_, executor) = setup();
        let tenant = TenantId::new();
        let (batch, children) = executor
            .batches()
            .create_batch(tenant, publish(), new_jobs(tenant, &["a", "b", "bad-c"]))
            .await
            .unwrap();
        assert_eq!(children.len(), 3);
        assert!(children.iter().all(|j| j.batch_id == Some(batch.batch_id)));

        let progress = executor.batches().get_progress(batch.batch_id).await.unwrap();
        assert_eq!(progress.status, BatchStatus::Pending);
        assert_eq!(progress.pending_count, 3);

        assert_eq!(drain(&executor).await.len(), 3);

        let progress = executor.batches().get_progress(batch.batch_id).await.unwrap();
        assert_eq!(progress.status, BatchStatus::PartiallyFailed);
        assert_eq!(progress.completed_count, 2);
        assert_eq!(progress.failed_count, 1);
        assert_eq!(progress.progress_percent, 100.0);
        assert!(!progress.is_active);
    }

    #[tokio::test]
    async fn batch_is_running_after_first_claim() {
        let (_, executor) = setup();
        let tenant = TenantId::new();
        let (batch, _) = executor
            .batches()
            .create_batch(tenant, publish(), new_jobs(tenant, &["a", "b"]))
            .await
            .unwrap();

        let job = executor
            .claim_next_job(&ClaimFilter::default())
            .await
            .unwrap()
            .unwrap();
        let progress = executor.batches().get_progress(batch.batch_id).await.unwrap();
        assert_eq!(progress.status, BatchStatus::Running);

        executor.run_job(job).await.unwrap();
        let progress = executor.batches().get_progress(batch.batch_id).await.unwrap();
        assert_eq!(progress.status, BatchStatus::Running);
        assert_eq!(progress.progress_percent, 50.0);
    }

    #[tokio::test]
    async fn all_failures_fail_the_batch() {
        let (_, executor) = setup();
        let tenant = TenantId::new();
        let (batch, _) = executor
            .batches()
            .create_batch(tenant, publish(), new_jobs(tenant, &["bad-1", "bad-2"]))
            .await
            .unwrap();
        drain(&executor).await;

        let progress = executor.batches().get_progress(batch.batch_id).await.unwrap();
        assert_eq!(progress.status, BatchStatus::Failed);
    }

    #[tokio::test]
    async fn cancelled_batch_skips_unclaimed_children_and_never_reverts() {
        let (store, executor) = setup();
        let tenant = TenantId::new();
        let (batch, _) = executor
            .batches()
            .create_batch(tenant, publish(), new_jobs(tenant, &["a", "b", "c"]))
            .await
            .unwrap();

        let in_flight = executor
            .claim_next_job(&ClaimFilter::default())
            .await
            .unwrap()
            .unwrap();
        let cancelled = executor
            .batches()
            .cancel_batch(batch.batch_id, "cancelled by operator")
            .await
            .unwrap();
        assert_eq!(cancelled.status, BatchStatus::Cancelled);
        assert_eq!(cancelled.cancelled_count, 2);

        assert_eq!(executor.run_job(in_flight).await.unwrap(), JobOutcome::Succeeded);
        assert!(drain(&executor).await.is_empty());

        let progress = executor.batches().get_progress(batch.batch_id).await.unwrap();
        assert_eq!(progress.status, BatchStatus::Cancelled);
        assert_eq!(progress.completed_count, 1);
        assert_eq!(progress.pending_count, 0);

        let children = store.list_batch_jobs(batch.batch_id).await.unwrap();
        assert_eq!(
            children
                .iter()
                .filter(|j| j.status == JobStatus::Cancelled)
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn unknown_batch_is_not_found() {
        let (_, executor) = setup();
        let missing = BatchId::new();
        assert!(matches!(
            executor.batches().get_progress(missing).await,
            Err(StoreError::BatchNotFound(id)) if id == missing
        ));
    }
}
