//! The job entity and its lifecycle transitions.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use listingsync_core::{BatchId, DomainError, DomainResult, JobId, TenantId};

use crate::kind::JobKind;
use crate::retry::RetryPolicy;
use crate::status::JobStatus;

/// Lifetime of a job that was submitted without an explicit expiry.
pub const DEFAULT_JOB_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Error message stored on jobs swept because they expired unclaimed.
pub const EXPIRED_MESSAGE: &str = "expired before execution";

/// Prefix of the error left on a retry dropped because its batch was cancelled.
pub const BATCH_CANCELLED_MESSAGE: &str = "batch cancelled before retry";

/// Caller-supplied fields for a new job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub tenant_id: TenantId,
    pub kind: JobKind,
    pub product_id: String,
    /// Lower is more urgent.
    pub priority: i32,
    pub max_retries: u32,
    pub input_data: serde_json::Value,
    /// Absolute expiry; `None` means `created_at + DEFAULT_JOB_TTL`.
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(tenant_id: TenantId, kind: JobKind, product_id: impl Into<String>) -> Self {
        Self {
            tenant_id,
            kind,
            product_id: product_id.into(),
            priority: 100,
            max_retries: 3,
            input_data: serde_json::Value::Null,
            expires_at: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input_data = input;
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }
}

/// One unit of marketplace work: one product, one marketplace, one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub kind: JobKind,
    pub product_id: String,
    pub batch_id: Option<BatchId>,
    pub priority: i32,
    pub status: JobStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub input_data: serde_json::Value,
    pub result_data: Option<serde_json::Value>,
    pub error_message: Option<String>,
    /// Token of the current (or last) claim; finishing writes must present it.
    pub claim_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// First claim only.
    pub started_at: Option<DateTime<Utc>>,
    /// Every claim; staleness is measured from here.
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Materialize a pending job from caller input.
    pub fn new(new: NewJob, now: DateTime<Utc>) -> DomainResult<Self> {
        if new.product_id.trim().is_empty() {
            return Err(DomainError::validation("product_id must not be empty"));
        }
        let ttl = chrono::Duration::from_std(DEFAULT_JOB_TTL)
            .map_err(|e| DomainError::invariant(e.to_string()))?;
        let expires_at = new.expires_at.unwrap_or(now + ttl);

        Ok(Self {
            id: JobId::new(),
            tenant_id: new.tenant_id,
            kind: new.kind,
            product_id: new.product_id,
            batch_id: None,
            priority: new.priority,
            status: JobStatus::Pending,
            retry_count: 0,
            max_retries: new.max_retries,
            input_data: new.input_data,
            result_data: None,
            error_message: None,
            claim_id: None,
            created_at: now,
            updated_at: now,
            expires_at,
            started_at: None,
            claimed_at: None,
            completed_at: None,
            retry_at: None,
        })
    }

    pub fn in_batch(mut self, batch_id: BatchId) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    /// PENDING and not yet expired.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.expires_at > now
    }

    /// PENDING past its expiry; the expire sweep cancels these.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.expires_at <= now
    }

    /// RUNNING with a claim older than `cutoff`.
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running && self.claimed_at.is_some_and(|at| at < cutoff)
    }

    /// RETRY_PENDING whose backoff has elapsed.
    pub fn is_retry_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::RetryPending && self.retry_at.is_none_or(|at| at <= now)
    }

    /// Whether this attempt was claimed with `claim_id` and is still running.
    pub fn is_held_by(&self, claim_id: Uuid) -> bool {
        self.status == JobStatus::Running && self.claim_id == Some(claim_id)
    }

    /// PENDING → RUNNING under a fresh claim token.
    pub fn claim(&mut self, claim_id: Uuid, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.is_claimable(now) {
            return Err(DomainError::illegal_transition(format!(
                "job {} cannot be claimed from {}",
                self.id, self.status
            )));
        }
        self.status = JobStatus::Running;
        self.claim_id = Some(claim_id);
        self.claimed_at = Some(now);
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.updated_at = now;
        Ok(())
    }

    /// RUNNING → SUCCESS. Clears any error left by earlier attempts.
    pub fn record_success(
        &mut self,
        result: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.ensure_running("complete")?;
        self.status = JobStatus::Success;
        self.result_data = result;
        self.error_message = None;
        self.retry_at = None;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// RUNNING → RETRY_PENDING (budget left and retryable) or FAILED.
    ///
    /// Returns the resulting status.
    pub fn record_failure(
        &mut self,
        error: impl Into<String>,
        retryable: bool,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> DomainResult<JobStatus> {
        self.ensure_running("fail")?;
        self.error_message = Some(error.into());
        self.updated_at = now;

        if retryable && self.retry_count < self.max_retries {
            self.retry_count += 1;
            let delay = chrono::Duration::from_std(policy.delay_for_attempt(self.retry_count))
                .unwrap_or_else(|_| chrono::Duration::zero());
            self.status = JobStatus::RetryPending;
            self.retry_at = Some(now + delay);
        } else {
            self.status = JobStatus::Failed;
            self.retry_at = None;
            self.completed_at = Some(now);
        }
        Ok(self.status)
    }

    /// RETRY_PENDING → PENDING once the backoff has elapsed.
    pub fn release_retry(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != JobStatus::RetryPending {
            return Err(DomainError::illegal_transition(format!(
                "job {} is {}, not RETRY_PENDING",
                self.id, self.status
            )));
        }
        self.status = JobStatus::Pending;
        self.retry_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// PENDING past expiry → CANCELLED.
    pub fn expire(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.is_expired(now) {
            return Err(DomainError::illegal_transition(format!(
                "job {} is not an expired pending job",
                self.id
            )));
        }
        self.finish_cancelled(EXPIRED_MESSAGE, now);
        Ok(())
    }

    /// Any non-terminal status → CANCELLED.
    pub fn cancel(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status.is_terminal() {
            return Err(DomainError::illegal_transition(format!(
                "job {} is already {}",
                self.id, self.status
            )));
        }
        self.finish_cancelled(reason, now);
        Ok(())
    }

    /// RETRY_PENDING → CANCELLED for a child whose batch was cancelled.
    ///
    /// Keeps the last attempt's error in the message. Returns whether the job
    /// changed.
    pub fn abandon_retry(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::RetryPending {
            return false;
        }
        let reason = match self.error_message.take() {
            Some(last) => format!("{BATCH_CANCELLED_MESSAGE}: {last}"),
            None => BATCH_CANCELLED_MESSAGE.to_string(),
        };
        self.finish_cancelled(reason, now);
        true
    }

    fn finish_cancelled(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.status = JobStatus::Cancelled;
        self.error_message = Some(reason.into());
        self.retry_at = None;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    fn ensure_running(&self, action: &str) -> DomainResult<()> {
        if self.status != JobStatus::Running {
            return Err(DomainError::illegal_transition(format!(
                "cannot {} job {} from {}",
                action, self.id, self.status
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::{ActionCode, Marketplace};

    fn test_tenant() -> TenantId {
        TenantId::new()
    }

    fn pending_job(now: DateTime<Utc>) -> Job {
        let new = NewJob::new(
            test_tenant(),
            JobKind::new(Marketplace::Ebay, ActionCode::Publish),
            "sku-1",
        );
        Job::new(new, now).unwrap()
    }

    #[test]
    fn new_job_defaults_expiry_to_ttl() {
        let now = Utc::now();
        let job = pending_job(now);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.expires_at, now + chrono::Duration::hours(24));
    }

    #[test]
    fn empty_product_id_is_rejected() {
        let new = NewJob::new(
            test_tenant(),
            JobKind::new(Marketplace::Etsy, ActionCode::Update),
            "  ",
        );
        assert!(Job::new(new, Utc::now()).is_err());
    }

    #[test]
    fn started_at_is_set_only_on_first_claim() {
        let t0 = Utc::now();
        let mut job = pending_job(t0);
        job.claim(Uuid::new_v4(), t0).unwrap();
        assert_eq!(job.started_at, Some(t0));

        job.record_failure("boom", true, &RetryPolicy::immediate(), t0)
            .unwrap();
        let t1 = t0 + chrono::Duration::seconds(5);
        job.release_retry(t1).unwrap();
        job.claim(Uuid::new_v4(), t1).unwrap();

        assert_eq!(job.started_at, Some(t0));
        assert_eq!(job.claimed_at, Some(t1));
    }

    #[test]
    fn expired_job_cannot_be_claimed() {
        let now = Utc::now();
        let mut job = pending_job(now);
        job.expires_at = now;
        assert!(job.claim(Uuid::new_v4(), now).is_err());

        job.expire(now).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.error_message.as_deref(), Some(EXPIRED_MESSAGE));
        assert_eq!(job.completed_at, Some(now));
    }

    #[test]
    fn abandoned_retry_is_cancelled_with_last_error() {
        let now = Utc::now();
        let mut job = pending_job(now);
        assert!(!job.abandon_retry(now));

        job.claim(Uuid::new_v4(), now).unwrap();
        job.record_failure("rate limited", true, &RetryPolicy::immediate(), now)
            .unwrap();
        assert!(job.abandon_retry(now));
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(
            job.error_message.as_deref(),
            Some("batch cancelled before retry: rate limited")
        );
        assert!(job.retry_at.is_none());
        assert_eq!(job.completed_at, Some(now));
    }

    #[test]
    fn retryable_failure_requeues_until_budget_is_spent() {
        let now = Utc::now();
        let mut job = pending_job(now);
        job.max_retries = 1;
        let policy = RetryPolicy::fixed(std::time::Duration::from_secs(30));

        job.claim(Uuid::new_v4(), now).unwrap();
        let status = job.record_failure("timeout", true, &policy, now).unwrap();
        assert_eq!(status, JobStatus::RetryPending);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.retry_at, Some(now + chrono::Duration::seconds(30)));
        assert!(job.completed_at.is_none());
        assert!(!job.is_retry_due(now));

        let later = now + chrono::Duration::seconds(30);
        job.release_retry(later).unwrap();
        job.claim(Uuid::new_v4(), later).unwrap();
        let status = job.record_failure("timeout", true, &policy, later).unwrap();
        assert_eq!(status, JobStatus::Failed);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.completed_at, Some(later));
        assert_eq!(job.error_message.as_deref(), Some("timeout"));
    }

    #[test]
    fn non_retryable_failure_is_final() {
        let now = Utc::now();
        let mut job = pending_job(now);
        job.claim(Uuid::new_v4(), now).unwrap();
        let status = job
            .record_failure("bad request", false, &RetryPolicy::immediate(), now)
            .unwrap();
        assert_eq!(status, JobStatus::Failed);
        assert_eq!(job.retry_count, 0);
    }

    #[test]
    fn success_after_retries_clears_error() {
        let now = Utc::now();
        let mut job = pending_job(now);
        let policy = RetryPolicy::immediate();

        for _ in 0..2 {
            job.claim(Uuid::new_v4(), now).unwrap();
            job.record_failure("flaky", true, &policy, now).unwrap();
            job.release_retry(now).unwrap();
        }
        job.claim(Uuid::new_v4(), now).unwrap();
        job.record_success(Some(serde_json::json!({"listing": 9})), now)
            .unwrap();

        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.retry_count, 2);
        assert!(job.error_message.is_none());
    }

    #[test]
    fn stale_is_measured_from_latest_claim() {
        let t0 = Utc::now();
        let mut job = pending_job(t0);
        job.claim(Uuid::new_v4(), t0).unwrap();
        assert!(job.is_stale(t0 + chrono::Duration::seconds(1)));
        assert!(!job.is_stale(t0));
    }

    #[test]
    fn terminal_job_cannot_be_cancelled() {
        let now = Utc::now();
        let mut job = pending_job(now);
        job.cancel("operator", now).unwrap();
        assert!(job.cancel("operator", now).is_err());
    }

    #[test]
    fn claim_token_guards_ownership() {
        let now = Utc::now();
        let mut job = pending_job(now);
        let token = Uuid::new_v4();
        job.claim(token, now).unwrap();
        assert!(job.is_held_by(token));
        assert!(!job.is_held_by(Uuid::new_v4()));
    }
}
