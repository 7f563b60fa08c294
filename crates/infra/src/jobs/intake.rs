//! In-process job submission.
//!
//! Jobs can equally be inserted with plain SQL; the Postgres trigger then
//! publishes the wake-up notification. `JobIntake` additionally publishes on
//! a bus when one is attached, which is how in-memory setups wake workers.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use listingsync_core::TenantId;
use listingsync_events::{InMemoryNotificationBus, JobNotification, NotificationBus};
use listingsync_jobs::{Batch, Job, JobKind, NewJob};

use super::batch::BatchJobService;
use super::store::{JobStore, StoreResult};

/// Submits jobs and batches, waking workers through an optional bus.
pub struct JobIntake<S: ?Sized, B = InMemoryNotificationBus<JobNotification>> {
    store: Arc<S>,
    batches: BatchJobService<S>,
    bus: Option<B>,
}

impl<S> JobIntake<S>
where
    S: JobStore + ?Sized,
{
    /// Intake that relies on the store to notify workers.
    pub fn without_bus(store: Arc<S>) -> Self {
        Self::with_bus(store, None)
    }
}

impl<S, B> JobIntake<S, B>
where
    S: JobStore + ?Sized,
    B: NotificationBus<JobNotification>,
{
    pub fn with_bus(store: Arc<S>, bus: Option<B>) -> Self {
        Self {
            batches: BatchJobService::new(store.clone()),
            store,
            bus,
        }
    }

    pub async fn submit_job(&self, new: NewJob) -> StoreResult<Job> {
        let job = self.store.insert_job(Job::new(new, Utc::now())?).await?;
        info!(
            job_id = %job.id,
            tenant_id = %job.tenant_id,
            kind = %job.kind,
            product_id = %job.product_id,
            priority = job.priority,
            "job submitted"
        );
        self.notify(&job).await;
        Ok(job)
    }

    pub async fn submit_batch(
        &self,
        tenant_id: TenantId,
        kind: JobKind,
        jobs: Vec<NewJob>,
    ) -> StoreResult<(Batch, Vec<Job>)> {
        let (batch, jobs) = self.batches.create_batch(tenant_id, kind, jobs).await?;
        for job in &jobs {
            self.notify(job).await;
        }
        Ok((batch, jobs))
    }

    /// Best effort: a lost notification only delays the job until the next poll.
    async fn notify(&self, job: &Job) {
        let Some(bus) = &self.bus else {
            return;
        };
        if let Err(err) = bus.publish(JobNotification::new(job.id, job.tenant_id)).await {
            warn!(job_id = %job.id, error = %err, "failed to publish job notification");
        }
    }
}
