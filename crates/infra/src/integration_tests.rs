//! End-to-end pipeline over the in-memory backends.
//!
//! Intake → notification → Worker → Executor → Orchestrator → Batch
//!
//! Verifies:
//! - multi-step jobs resume at the failed step after a retry
//! - batches settle once every child is terminal
//! - a tenant-pinned worker never touches other tenants' jobs

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;

    use listingsync_core::TenantId;
    use listingsync_events::{InMemoryNotificationBus, JobNotification};
    use listingsync_jobs::{
        ActionCode, BatchStatus, HandlerError, HandlerRegistry, Job, JobHandler, JobKind,
        JobStatus, Marketplace, NewJob, RetryPolicy, StepHandlers, TaskStatus,
    };

    use crate::config::{WorkerConfig, WorkerSettings};
    use crate::jobs::{ExecutorSettings, InMemoryJobStore, JobExecutor, JobIntake, JobStore};
    use crate::workers::{ExitReason, Worker};

    const STEPS: [&str; 4] = ["validate", "upload_image_1", "upload_image_2", "create_listing"];

    fn publish() -> JobKind {
        JobKind::new(Marketplace::Shopify, ActionCode::Publish)
    }

    /// Four-step publish whose first image upload times out once per product.
    #[derive(Default)]
    struct ShopifyPublish {
        uploads: Arc<Mutex<Vec<String>>>,
        timeouts: Arc<AtomicU32>,
    }

    #[async_trait]
    impl JobHandler for ShopifyPublish {
        fn create_tasks(&self, _job: &Job) -> Vec<String> {
            STEPS.iter().map(|s| s.to_string()).collect()
        }

        fn step_handlers(&self) -> Option<StepHandlers> {
            let mut steps = StepHandlers::new();
            for step in STEPS {
                let uploads = self.uploads.clone();
                let timeouts = self.timeouts.clone();
                steps = steps.step(step, move |job: Job| {
                    let uploads = uploads.clone();
                    let timeouts = timeouts.clone();
                    async move {
                        let key = format!("{}:{step}", job.product_id);
                        let first_try = !uploads.lock().unwrap().contains(&key);
                        uploads.lock().unwrap().push(key);
                        if step == "upload_image_1" && first_try {
                            timeouts.fetch_add(1, Ordering::SeqCst);
                            return Err(HandlerError::retryable("image host timed out"));
                        }
                        Ok(serde_json::json!({ "step": step }))
                    }
                });
            }
            Some(steps)
        }
    }

    fn config(tenant: Option<TenantId>) -> WorkerConfig {
        WorkerConfig::from_settings(WorkerSettings {
            database_url: "memory://".to_string(),
            idle_timeout_hours: 0.01,
            poll_interval_secs: 1.0,
            tenant: tenant.map(|t| t.to_string()),
            ..WorkerSettings::default()
        })
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn batch_of_multi_step_jobs_completes_after_retries() {
        let store = Arc::new(InMemoryJobStore::new());
        let bus = Arc::new(InMemoryNotificationBus::<JobNotification>::new());
        let handler = ShopifyPublish::default();
        let uploads = handler.uploads.clone();
        let timeouts = handler.timeouts.clone();

        let intake = JobIntake::with_bus(store.clone(), Some(bus.clone()));
        let tenant = TenantId::new();
        let products = ["lamp", "chair", "desk"];
        let (batch, jobs) = intake
            .submit_batch(
                tenant,
                publish(),
                products
                    .iter()
                    .map(|p| NewJob::new(tenant, publish(), *p))
                    .collect(),
            )
            .await
            .unwrap();

        let executor = JobExecutor::new(
            store.clone(),
            HandlerRegistry::new().with(publish(), handler),
            ExecutorSettings::default().with_retry_policy(RetryPolicy::immediate()),
        );
        let exit = Worker::new(config(None), Arc::new(executor), bus).run().await;
        assert_eq!(exit.reason, ExitReason::IdleTimeout);
        assert_eq!(exit.jobs_claimed, 6);
        assert_eq!(timeouts.load(Ordering::SeqCst), 3);

        for job in &jobs {
            let done = store.get_job(job.id).await.unwrap().unwrap();
            assert_eq!(done.status, JobStatus::Success);
            assert_eq!(done.retry_count, 1);
            let tasks = store.list_tasks(job.id).await.unwrap();
            assert!(tasks.iter().all(|t| t.status == TaskStatus::Success));
        }

        // `validate` ran once per product, never again on the retry.
        let uploads = uploads.lock().unwrap();
        for product in products {
            let key = format!("{product}:validate");
            assert_eq!(uploads.iter().filter(|k| **k == key).count(), 1);
        }

        let settled = store.get_batch(batch.batch_id).await.unwrap().unwrap();
        assert_eq!(settled.status, BatchStatus::Completed);
        assert_eq!(settled.progress_percent(), 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn tenant_pinned_worker_leaves_other_tenants_alone() {
        let store = Arc::new(InMemoryJobStore::new());
        let bus = Arc::new(InMemoryNotificationBus::<JobNotification>::new());
        let intake = JobIntake::with_bus(store.clone(), Some(bus.clone()));

        let ours = TenantId::new();
        let theirs = TenantId::new();
        let our_job = intake
            .submit_job(NewJob::new(ours, publish(), "lamp"))
            .await
            .unwrap();
        let their_job = intake
            .submit_job(NewJob::new(theirs, publish(), "sofa"))
            .await
            .unwrap();

        let executor = JobExecutor::new(
            store.clone(),
            HandlerRegistry::new().with(publish(), ShopifyPublish::default()),
            ExecutorSettings::default().with_retry_policy(RetryPolicy::immediate()),
        );
        let worker = Worker::new(config(Some(ours)), Arc::new(executor), bus);
        let exit = worker.run().await;
        assert_eq!(exit.reason, ExitReason::IdleTimeout);

        let ours = store.get_job(our_job.id).await.unwrap().unwrap();
        let theirs = store.get_job(their_job.id).await.unwrap().unwrap();
        assert_eq!(ours.status, JobStatus::Success);
        assert_eq!(theirs.status, JobStatus::Pending);
        assert!(theirs.started_at.is_none());
        assert!(exit.uptime >= Duration::from_secs(36));
    }
}
