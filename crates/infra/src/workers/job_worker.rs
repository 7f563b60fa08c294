use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use listingsync_core::TenantId;
use listingsync_events::{JobNotification, NotificationBus, Subscription};
use listingsync_jobs::Job;

use crate::config::WorkerConfig;
use crate::jobs::{ClaimFilter, JobExecutor, JobStore};

const SHUTDOWN_CANCEL_REASON: &str = "cancelled by worker shutdown";

/// Observable lifecycle of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Listening,
    Claiming,
    Draining,
    Stopped,
}

/// Why `Worker::run` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Shutdown,
    IdleTimeout,
    MaxAge,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub reason: ExitReason,
    pub jobs_claimed: u64,
    pub uptime: Duration,
}

/// Handle to control a running worker from outside its task.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    shutdown: CancellationToken,
    wake: Arc<Notify>,
    state: watch::Receiver<WorkerState>,
}

impl WorkerHandle {
    /// Request graceful shutdown. `run` returns once draining is done.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Trigger a claim pass without waiting for a notification or poll.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Watch state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<WorkerState> {
        self.state.clone()
    }
}

/// Claims and runs jobs with bounded parallelism until shutdown or retirement.
///
/// - wakes on notifications, explicit `wake()` calls, finished jobs, and
///   every `poll_interval`
/// - at most `max_concurrency` jobs in flight, at most
///   `per_tenant_concurrency` of them for one tenant
/// - retires after `idle_timeout` without work or after `max_age`
pub struct Worker<S: ?Sized, B> {
    config: WorkerConfig,
    executor: Arc<JobExecutor<S>>,
    bus: B,
    shutdown: CancellationToken,
    wake: Arc<Notify>,
    state: watch::Sender<WorkerState>,
}

enum Wake {
    Claim,
    Idle,
}

impl<S, B> Worker<S, B>
where
    S: JobStore + ?Sized + 'static,
    B: NotificationBus<JobNotification>,
{
    pub fn new(config: WorkerConfig, executor: Arc<JobExecutor<S>>, bus: B) -> Self {
        let (state, _) = watch::channel(WorkerState::Starting);
        Self {
            config,
            executor,
            bus,
            shutdown: CancellationToken::new(),
            wake: Arc::new(Notify::new()),
            state,
        }
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            shutdown: self.shutdown.clone(),
            wake: self.wake.clone(),
            state: self.state.subscribe(),
        }
    }

    pub async fn run(self) -> WorkerExit {
        let started = Instant::now();
        let retire_at = started + self.config.max_age;
        let global = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut tenants: HashMap<TenantId, Arc<Semaphore>> = HashMap::new();
        let mut in_flight: JoinSet<()> = JoinSet::new();
        let filter = self.config.claim_filter();
        let mut jobs_claimed = 0u64;
        let mut last_activity = started;
        let mut next_poll = started + self.config.poll_interval;

        info!(
            worker = %self.config.worker_name,
            scope = %self.config.scope,
            max_concurrency = self.config.max_concurrency,
            per_tenant_concurrency = self.config.per_tenant_concurrency,
            "worker starting"
        );
        let mut subscription = self.subscribe().await;

        let mut wake = Wake::Claim;
        let reason = loop {
            if self.shutdown.is_cancelled() {
                break ExitReason::Shutdown;
            }

            if let Wake::Claim = wake {
                self.set_state(WorkerState::Claiming);
                let claimed = self
                    .claim_available(&filter, &global, &mut tenants, &mut in_flight)
                    .await;
                if claimed > 0 {
                    jobs_claimed += claimed;
                    last_activity = Instant::now();
                }
                // Only a real claim pass pushes the fallback poll back.
                next_poll = Instant::now() + self.config.poll_interval;
                self.set_state(WorkerState::Listening);
            }

            let now = Instant::now();
            if now >= retire_at {
                break ExitReason::MaxAge;
            }
            let idle_at = last_activity + self.config.idle_timeout;
            if in_flight.is_empty() && now >= idle_at {
                break ExitReason::IdleTimeout;
            }
            let deadline = if in_flight.is_empty() {
                retire_at.min(idle_at)
            } else {
                retire_at
            };

            wake = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break ExitReason::Shutdown,
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    log_join(joined);
                    last_activity = Instant::now();
                    Wake::Claim
                }
                _ = self.wake.notified() => Wake::Claim,
                received = next_notification(&mut subscription) => match received {
                    Some(notification) if self.config.scope.includes(notification.tenant) => {
                        if let Some(sub) = subscription.as_mut() {
                            sub.drain();
                        }
                        debug!(job_id = %notification.job_id, "woken by notification");
                        Wake::Claim
                    }
                    Some(_) => Wake::Idle,
                    None => {
                        warn!(
                            worker = %self.config.worker_name,
                            "notification subscription closed; falling back to polling"
                        );
                        subscription = None;
                        Wake::Idle
                    }
                },
                _ = tokio::time::sleep_until(next_poll) => {
                    if subscription.is_none() {
                        subscription = self.subscribe().await;
                    }
                    Wake::Claim
                }
                _ = tokio::time::sleep_until(deadline) => Wake::Idle,
            };
        };

        self.drain(reason, &mut in_flight).await;

        let exit = WorkerExit {
            reason,
            jobs_claimed,
            uptime: started.elapsed(),
        };
        info!(
            worker = %self.config.worker_name,
            reason = ?exit.reason,
            jobs_claimed = exit.jobs_claimed,
            uptime_secs = exit.uptime.as_secs(),
            "worker stopped"
        );
        self.set_state(WorkerState::Stopped);
        exit
    }

    async fn subscribe(&self) -> Option<Subscription<JobNotification>> {
        match self.bus.subscribe().await {
            Ok(sub) => Some(sub),
            Err(err) => {
                warn!(
                    worker = %self.config.worker_name,
                    error = %err,
                    "could not subscribe to job notifications; polling only"
                );
                None
            }
        }
    }

    /// Sweep, then claim until nothing is claimable or a bound is hit.
    async fn claim_available(
        &self,
        base: &ClaimFilter,
        global: &Arc<Semaphore>,
        tenants: &mut HashMap<TenantId, Arc<Semaphore>>,
        in_flight: &mut JoinSet<()>,
    ) -> u64 {
        if let Err(err) = self.executor.run_sweeps().await {
            warn!(worker = %self.config.worker_name, error = %err, "sweeps failed");
        }

        let per_tenant = self.config.per_tenant_concurrency;
        let mut claimed = 0;
        while !self.shutdown.is_cancelled() {
            let Ok(global_permit) = global.clone().try_acquire_owned() else {
                debug!(worker = %self.config.worker_name, "at max concurrency");
                break;
            };

            tenants.retain(|_, sem| sem.available_permits() < per_tenant);
            let saturated = tenants
                .iter()
                .filter(|(_, sem)| sem.available_permits() == 0)
                .map(|(tenant, _)| *tenant);
            let filter = base.clone().excluding(saturated);

            let job = match self.executor.claim_next_job(&filter).await {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(err) => {
                    warn!(worker = %self.config.worker_name, error = %err, "claim failed");
                    break;
                }
            };

            // Saturated tenants are excluded above, so a permit is free here.
            let tenant_permit = tenants
                .entry(job.tenant_id)
                .or_insert_with(|| Arc::new(Semaphore::new(per_tenant)))
                .clone()
                .try_acquire_owned()
                .ok();

            claimed += 1;
            let executor = self.executor.clone();
            in_flight.spawn(execute(executor, job, (global_permit, tenant_permit)));
        }
        claimed
    }

    async fn drain(&self, reason: ExitReason, in_flight: &mut JoinSet<()>) {
        self.set_state(WorkerState::Draining);
        info!(
            worker = %self.config.worker_name,
            reason = ?reason,
            in_flight = in_flight.len(),
            "draining"
        );

        if reason == ExitReason::Shutdown && self.config.cancel_pending_on_shutdown {
            if let Err(err) = self
                .executor
                .cancel_unclaimed(self.config.scope, SHUTDOWN_CANCEL_REASON)
                .await
            {
                warn!(worker = %self.config.worker_name, error = %err, "failed to cancel pending jobs");
            }
        }

        let drained = tokio::time::timeout(self.config.graceful_shutdown, async {
            while let Some(joined) = in_flight.join_next().await {
                log_join(joined);
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                worker = %self.config.worker_name,
                remaining = in_flight.len(),
                "graceful shutdown timed out; aborting in-flight jobs"
            );
            in_flight.abort_all();
            while in_flight.join_next().await.is_some() {}
        }

        match self.executor.store().stats(self.config.scope).await {
            Ok(stats) => info!(worker = %self.config.worker_name, ?stats, "job stats"),
            Err(err) => warn!(worker = %self.config.worker_name, error = %err, "could not read job stats"),
        }
    }

    fn set_state(&self, state: WorkerState) {
        self.state.send_replace(state);
    }
}

async fn next_notification(
    subscription: &mut Option<Subscription<JobNotification>>,
) -> Option<JobNotification> {
    match subscription {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

/// One claimed job; the permits are released when it finishes.
async fn execute<S>(
    executor: Arc<JobExecutor<S>>,
    job: Job,
    permits: (OwnedSemaphorePermit, Option<OwnedSemaphorePermit>),
) where
    S: JobStore + ?Sized,
{
    let _permits = permits;
    let job_id = job.id;
    match executor.run_job(job).await {
        Ok(outcome) => debug!(%job_id, ?outcome, "attempt finished"),
        // The job stays RUNNING and is recovered by the stale sweep.
        Err(err) => error!(%job_id, error = %err, "could not record job result"),
    }
}

fn log_join(joined: Result<(), JoinError>) {
    if let Err(err) = joined {
        if err.is_panic() {
            error!(error = %err, "job execution panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::config::WorkerSettings;
    use crate::jobs::{ExecutorSettings, InMemoryJobStore, JobIntake};
    use listingsync_core::JobId;
    use listingsync_events::InMemoryNotificationBus;
    use listingsync_jobs::{
        ActionCode, HandlerError, HandlerRegistry, JobHandler, JobKind, JobStatus, Marketplace,
        NewJob, RetryPolicy,
    };

    type Bus = Arc<InMemoryNotificationBus<JobNotification>>;

    fn publish() -> JobKind {
        JobKind::new(Marketplace::Amazon, ActionCode::Publish)
    }

    /// Sleeps, tracking how many jobs of each tenant run at once.
    #[derive(Default)]
    struct SlowPublish {
        delay: Duration,
        running: Mutex<HashMap<TenantId, (usize, usize)>>,
    }

    impl SlowPublish {
        fn peak(&self, tenant: TenantId) -> usize {
            self.running.lock().unwrap().get(&tenant).map_or(0, |(_, peak)| *peak)
        }
    }

    #[async_trait]
    impl JobHandler for SlowPublish {
        async fn execute(&self, job: &Job) -> Result<serde_json::Value, HandlerError> {
            {
                let mut running = self.running.lock().unwrap();
                let entry = running.entry(job.tenant_id).or_default();
                entry.0 += 1;
                entry.1 = entry.1.max(entry.0);
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.running.lock().unwrap().entry(job.tenant_id).or_default().0 -= 1;
            Ok(serde_json::json!({ "published": job.product_id }))
        }
    }

    fn config(tweak: impl FnOnce(&mut WorkerSettings)) -> WorkerConfig {
        let mut settings = WorkerSettings {
            database_url: "memory://".to_string(),
            idle_timeout_hours: 0.01,
            poll_interval_secs: 1.0,
            ..WorkerSettings::default()
        };
        tweak(&mut settings);
        WorkerConfig::from_settings(settings).unwrap()
    }

    struct Harness {
        store: Arc<InMemoryJobStore>,
        bus: Bus,
        handler: Arc<SlowPublish>,
    }

    impl Harness {
        fn new(delay: Duration) -> Self {
            Self {
                store: Arc::new(InMemoryJobStore::new()),
                bus: Arc::new(InMemoryNotificationBus::new()),
                handler: Arc::new(SlowPublish {
                    delay,
                    ..SlowPublish::default()
                }),
            }
        }

        fn worker(&self, config: WorkerConfig) -> Worker<InMemoryJobStore, Bus> {
            let mut registry = HandlerRegistry::new();
            registry.register_arc(publish(), self.handler.clone());
            let executor = JobExecutor::new(
                self.store.clone(),
                registry,
                ExecutorSettings::default().with_retry_policy(RetryPolicy::immediate()),
            );
            Worker::new(config, Arc::new(executor), self.bus.clone())
        }

        async fn submit(&self, tenant: TenantId, count: usize) -> Vec<Job> {
            let intake = JobIntake::with_bus(self.store.clone(), Some(self.bus.clone()));
            let mut jobs = Vec::new();
            for n in 0..count {
                let new = NewJob::new(tenant, publish(), format!("sku-{n}"));
                jobs.push(intake.submit_job(new).await.unwrap());
            }
            jobs
        }

        async fn status(&self, job: &Job) -> JobStatus {
            self.store.get_job(job.id).await.unwrap().unwrap().status
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_all_jobs_then_retires_when_idle() {
        let h = Harness::new(Duration::from_millis(50));
        let tenant = TenantId::new();
        let jobs = h.submit(tenant, 3).await;

        let worker = h.worker(config(|_| {}));
        let handle = worker.handle();
        let exit = worker.run().await;

        assert_eq!(exit.reason, ExitReason::IdleTimeout);
        assert_eq!(exit.jobs_claimed, 3);
        assert_eq!(handle.state(), WorkerState::Stopped);
        for job in &jobs {
            assert_eq!(h.status(job).await, JobStatus::Success);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn per_tenant_bound_leaves_room_for_other_tenants() {
        let h = Harness::new(Duration::from_millis(100));
        let busy = TenantId::new();
        let quiet = TenantId::new();
        let busy_jobs = h.submit(busy, 6).await;
        let quiet_jobs = h.submit(quiet, 2).await;

        let worker = h.worker(config(|s| {
            s.max_concurrency = 4;
            s.per_tenant_concurrency = 2;
        }));
        let exit = worker.run().await;

        assert_eq!(exit.jobs_claimed, 8);
        assert_eq!(h.handler.peak(busy), 2);
        assert_eq!(h.handler.peak(quiet), 2);
        for job in busy_jobs.iter().chain(quiet_jobs.iter()) {
            assert_eq!(h.status(job).await, JobStatus::Success);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn notification_wakes_worker_before_poll() {
        let h = Harness::new(Duration::ZERO);
        let worker = h.worker(config(|s| {
            s.poll_interval_secs = 3600.0;
            s.idle_timeout_hours = 2.0;
        }));
        let handle = worker.handle();
        let run = tokio::spawn(worker.run());

        let mut state = handle.subscribe_state();
        state
            .wait_for(|s| *s == WorkerState::Listening)
            .await
            .unwrap();

        let began = Instant::now();
        let job = h.submit(TenantId::new(), 1).await.remove(0);
        for _ in 0..100 {
            if h.status(&job).await == JobStatus::Success {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(h.status(&job).await, JobStatus::Success);
        assert!(began.elapsed() < Duration::from_secs(3600));

        handle.shutdown();
        let exit = run.await.unwrap();
        assert_eq!(exit.reason, ExitReason::Shutdown);
        assert_eq!(exit.jobs_claimed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_finds_unannounced_job_despite_foreign_notifications() {
        let h = Harness::new(Duration::ZERO);
        let ours = TenantId::new();
        let theirs = TenantId::new();
        let worker = h.worker(config(|s| {
            s.tenant = Some(ours.to_string());
            s.poll_interval_secs = 1.0;
            s.idle_timeout_hours = 2.0;
        }));
        let handle = worker.handle();
        let run = tokio::spawn(worker.run());

        let mut state = handle.subscribe_state();
        state
            .wait_for(|s| *s == WorkerState::Listening)
            .await
            .unwrap();

        // Inserted behind the bus's back: only the poll can find it.
        let job = Job::new(NewJob::new(ours, publish(), "sku-quiet"), Utc::now()).unwrap();
        h.store.insert_job(job.clone()).await.unwrap();

        // Another tenant keeps the channel busy at twice the poll rate.
        for _ in 0..10 {
            h.bus
                .publish(JobNotification::new(JobId::new(), theirs))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert_eq!(h.status(&job).await, JobStatus::Success);

        handle.shutdown();
        let exit = run.await.unwrap();
        assert_eq!(exit.jobs_claimed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_in_flight_jobs() {
        let h = Harness::new(Duration::from_secs(5));
        let jobs = h.submit(TenantId::new(), 2).await;

        let worker = h.worker(config(|_| {}));
        let handle = worker.handle();
        let run = tokio::spawn(worker.run());

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.shutdown();
        let exit = run.await.unwrap();

        assert_eq!(exit.reason, ExitReason::Shutdown);
        for job in &jobs {
            assert_eq!(h.status(job).await, JobStatus::Success);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_can_cancel_unclaimed_jobs() {
        let h = Harness::new(Duration::from_secs(1));
        let jobs = h.submit(TenantId::new(), 3).await;

        let worker = h.worker(config(|s| {
            s.max_concurrency = 1;
            s.per_tenant_concurrency = 1;
            s.cancel_pending_on_shutdown = true;
        }));
        let handle = worker.handle();
        let run = tokio::spawn(worker.run());

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.shutdown();
        let exit = run.await.unwrap();
        assert_eq!(exit.jobs_claimed, 1);

        let mut succeeded = 0;
        for job in &jobs {
            let stored = h.store.get_job(job.id).await.unwrap().unwrap();
            match stored.status {
                JobStatus::Success => succeeded += 1,
                JobStatus::Cancelled => assert_eq!(
                    stored.error_message.as_deref(),
                    Some(SHUTDOWN_CANCEL_REASON)
                ),
                other => panic!("unexpected status {other}"),
            }
        }
        assert_eq!(succeeded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn force_close_leaves_job_running_for_the_stale_sweep() {
        let h = Harness::new(Duration::from_secs(600));
        let jobs = h.submit(TenantId::new(), 1).await;

        let worker = h.worker(config(|s| s.graceful_shutdown_secs = 1));
        let handle = worker.handle();
        let run = tokio::spawn(worker.run());

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.shutdown();
        run.await.unwrap();

        let stored = h.store.get_job(jobs[0].id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Running);
        assert!(stored.is_stale(Utc::now() + chrono::Duration::hours(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn worker_retires_at_max_age() {
        let h = Harness::new(Duration::from_millis(10));
        let worker = h.worker(config(|s| {
            s.max_age_hours = 0.001;
            s.idle_timeout_hours = 1.0;
        }));
        let exit = worker.run().await;
        assert_eq!(exit.reason, ExitReason::MaxAge);
        assert!(exit.uptime >= Duration::from_millis(3600));
    }
}
