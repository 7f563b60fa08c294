//! Postgres job store against a real database.
//!
//! Run with `TEST_DATABASE_URL=postgres://... cargo test -p listingsync-infra -- --ignored`.
//! Every test works inside its own tenant, so a shared database is fine.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::future::join_all;
use sqlx::postgres::PgPoolOptions;

use listingsync_core::TenantId;
use listingsync_events::TenantScope;
use listingsync_infra::jobs::{ClaimFilter, JobStore, PostgresJobStore, migrate};
use listingsync_jobs::{
    ActionCode, Batch, BatchStatus, Job, JobKind, JobStatus, Marketplace, NewJob, RetryPolicy,
    Task, TaskStatus,
};

async fn store() -> PostgresJobStore {
    let url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .expect("failed to connect to TEST_DATABASE_URL");
    migrate(&pool).await.expect("migrations failed");
    PostgresJobStore::new(pool)
}

fn publish() -> JobKind {
    JobKind::new(Marketplace::Ebay, ActionCode::Publish)
}

fn new_job(tenant: TenantId, product: &str) -> Job {
    Job::new(NewJob::new(tenant, publish(), product), Utc::now()).unwrap()
}

fn scoped(tenant: TenantId) -> ClaimFilter {
    ClaimFilter::for_scope(TenantScope::Tenant(tenant))
}

#[tokio::test]
#[ignore = "needs TEST_DATABASE_URL"]
async fn insert_and_get_round_trips_every_field() {
    let store = store().await;
    let tenant = TenantId::new();
    let job = Job::new(
        NewJob::new(tenant, publish(), "sku-1")
            .with_priority(7)
            .with_max_retries(5)
            .with_input(serde_json::json!({ "title": "Lamp" })),
        Utc::now(),
    )
    .unwrap();
    store.insert_job(job.clone()).await.unwrap();

    let loaded = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(loaded.kind, publish());
    assert_eq!(loaded.priority, 7);
    assert_eq!(loaded.max_retries, 5);
    assert_eq!(loaded.input_data["title"], "Lamp");
    assert_eq!(loaded.status, JobStatus::Pending);
}

#[tokio::test]
#[ignore = "needs TEST_DATABASE_URL"]
async fn concurrent_claimers_never_share_a_job() {
    let store = Arc::new(store().await);
    let tenant = TenantId::new();
    for n in 0..20 {
        store.insert_job(new_job(tenant, &format!("sku-{n}"))).await.unwrap();
    }

    let claimers = (0..8).map(|_| {
        let store = store.clone();
        async move {
            let mut mine = Vec::new();
            while let Some(job) = store.claim_next_job(&scoped(tenant), Utc::now()).await.unwrap() {
                mine.push(job.id);
            }
            mine
        }
    });
    let claimed: Vec<_> = join_all(claimers).await.into_iter().flatten().collect();

    let unique: HashSet<_> = claimed.iter().copied().collect();
    assert_eq!(claimed.len(), 20);
    assert_eq!(unique.len(), 20);
}

#[tokio::test]
#[ignore = "needs TEST_DATABASE_URL"]
async fn sweeps_expire_requeue_and_release() {
    let store = store().await;
    let tenant = TenantId::new();
    let now = Utc::now();

    let expiring = Job::new(
        NewJob::new(tenant, publish(), "old").expires_at(now + Duration::seconds(1)),
        now,
    )
    .unwrap();
    store.insert_job(expiring.clone()).await.unwrap();
    let expired = store
        .expire_pending_jobs(now + Duration::seconds(2))
        .await
        .unwrap();
    assert!(expired.iter().any(|j| j.id == expiring.id));
    let expiring = store.get_job(expiring.id).await.unwrap().unwrap();
    assert_eq!(expiring.status, JobStatus::Cancelled);

    let running = new_job(tenant, "stuck");
    store.insert_job(running.clone()).await.unwrap();
    let claimed = store
        .claim_next_job(&scoped(tenant), now)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, running.id);

    let later = now + Duration::hours(1);
    let stale = store
        .sweep_stale_jobs(
            later - Duration::minutes(15),
            "job exceeded timeout",
            &RetryPolicy::immediate(),
            later,
        )
        .await
        .unwrap();
    assert!(stale.iter().any(|j| j.id == running.id));
    assert!(store.release_due_retries(later).await.unwrap() >= 1);

    let requeued = store.get_job(running.id).await.unwrap().unwrap();
    assert_eq!(requeued.status, JobStatus::Pending);
    assert_eq!(requeued.retry_count, 1);

    // The original claim no longer owns the job.
    let mut late = claimed.clone();
    late.record_success(None, later).unwrap();
    let claim_id = claimed.claim_id.unwrap();
    assert!(!store.finish_job(&mut late, claim_id).await.unwrap());
}

#[tokio::test]
#[ignore = "needs TEST_DATABASE_URL"]
async fn tasks_are_created_once_and_updated_in_place() {
    let store = store().await;
    let job = new_job(TenantId::new(), "sku-tasks");
    store.insert_job(job.clone()).await.unwrap();

    let plan = Task::plan(job.id, &["validate", "upload_image", "create_listing"]).unwrap();
    let created = store.create_tasks(job.id, plan).await.unwrap();
    let again = store
        .create_tasks(job.id, Task::plan(job.id, &["other"]).unwrap())
        .await
        .unwrap();
    assert_eq!(created, again);

    let mut first = created[0].clone();
    first.start(Utc::now());
    first.succeed(serde_json::json!({ "ok": true }), Utc::now());
    store.update_task(&first).await.unwrap();

    let tasks = store.list_tasks(job.id).await.unwrap();
    assert_eq!(tasks.len(), 3);
    assert_eq!(tasks[0].status, TaskStatus::Success);
    assert_eq!(tasks[1].status, TaskStatus::Pending);
}

#[tokio::test]
#[ignore = "needs TEST_DATABASE_URL"]
async fn batch_recompute_settles_status() {
    let store = store().await;
    let tenant = TenantId::new();
    let now = Utc::now();
    let batch = Batch::new(tenant, publish(), 2, now).unwrap();
    let children = vec![
        new_job(tenant, "a").in_batch(batch.batch_id),
        new_job(tenant, "b").in_batch(batch.batch_id),
    ];
    store.insert_batch(batch.clone(), children).await.unwrap();

    for outcome in [true, false] {
        let job = store
            .claim_next_job(&scoped(tenant), Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert!(store.mark_batch_started(batch.batch_id, Utc::now()).await.is_ok());
        let claim_id = job.claim_id.unwrap();
        let mut job = job;
        if outcome {
            job.record_success(None, Utc::now()).unwrap();
        } else {
            job.record_failure("rejected", false, &RetryPolicy::default(), Utc::now())
                .unwrap();
        }
        assert!(store.finish_job(&mut job, claim_id).await.unwrap());
        store.recompute_batch(batch.batch_id, Utc::now()).await.unwrap();
    }

    let settled = store.get_batch(batch.batch_id).await.unwrap().unwrap();
    assert_eq!(settled.status, BatchStatus::PartiallyFailed);
    assert_eq!(settled.completed_count, 1);
    assert_eq!(settled.failed_count, 1);
    assert!(settled.started_at.is_some());
}

#[tokio::test]
#[ignore = "needs TEST_DATABASE_URL"]
async fn retry_in_cancelled_batch_is_written_as_cancelled() {
    let store = store().await;
    let tenant = TenantId::new();
    let batch = Batch::new(tenant, publish(), 1, Utc::now()).unwrap();
    let child = new_job(tenant, "in-flight").in_batch(batch.batch_id);
    store.insert_batch(batch.clone(), vec![child]).await.unwrap();

    let mut job = store
        .claim_next_job(&scoped(tenant), Utc::now())
        .await
        .unwrap()
        .unwrap();
    let claim_id = job.claim_id.unwrap();
    store
        .cancel_batch(batch.batch_id, "cancelled by operator", Utc::now())
        .await
        .unwrap();

    let status = job
        .record_failure("rate limited", true, &RetryPolicy::immediate(), Utc::now())
        .unwrap();
    assert_eq!(status, JobStatus::RetryPending);
    assert!(store.finish_job(&mut job, claim_id).await.unwrap());
    assert_eq!(job.status, JobStatus::Cancelled);

    let stored = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Cancelled);
    let settled = store.recompute_batch(batch.batch_id, Utc::now()).await.unwrap();
    assert_eq!(settled.status, BatchStatus::Cancelled);
    assert_eq!(settled.progress_percent(), 100.0);
}

#[tokio::test]
#[ignore = "needs TEST_DATABASE_URL"]
async fn cancelled_batch_children_are_skipped() {
    let store = store().await;
    let tenant = TenantId::new();
    let batch = Batch::new(tenant, publish(), 1, Utc::now()).unwrap();
    let child = new_job(tenant, "x").in_batch(batch.batch_id);
    store.insert_batch(batch.clone(), vec![child]).await.unwrap();

    let (cancelled, jobs) = store
        .cancel_batch(batch.batch_id, "cancelled by operator", Utc::now())
        .await
        .unwrap();
    assert_eq!(cancelled.status, BatchStatus::Cancelled);
    assert_eq!(jobs.len(), 1);
    assert!(
        store
            .claim_next_job(&scoped(tenant), Utc::now())
            .await
            .unwrap()
            .is_none()
    );

    let stats = store.stats(TenantScope::Tenant(tenant)).await.unwrap();
    assert_eq!(stats.cancelled, 1);
    assert_eq!(stats.pending, 0);
}
