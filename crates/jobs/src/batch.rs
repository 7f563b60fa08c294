//! Batches: aggregate progress over jobs created together.
//!
//! Counters come from a [`BatchTally`] of the children's current statuses.
//! A batch turns terminal only once every child is terminal, and a terminal
//! batch keeps its status even if later tallies change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use listingsync_core::{BatchId, DomainError, DomainResult, TenantId};

use crate::kind::JobKind;
use crate::status::{BatchStatus, JobStatus};

/// Terminal-outcome counts of a batch's children.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchTally {
    pub succeeded: u32,
    pub failed: u32,
    pub cancelled: u32,
}

impl BatchTally {
    pub fn from_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = JobStatus>,
    {
        statuses
            .into_iter()
            .fold(Self::default(), |mut tally, status| {
                match status {
                    JobStatus::Success => tally.succeeded += 1,
                    JobStatus::Failed => tally.failed += 1,
                    JobStatus::Cancelled => tally.cancelled += 1,
                    _ => {}
                }
                tally
            })
    }

    pub fn finished(&self) -> u32 {
        self.succeeded + self.failed + self.cancelled
    }
}

/// A named group of jobs tracked as one user-visible operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub batch_id: BatchId,
    pub tenant_id: TenantId,
    pub kind: JobKind,
    pub total_count: u32,
    pub completed_count: u32,
    pub failed_count: u32,
    pub cancelled_count: u32,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Read model handed to callers polling a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub batch_id: BatchId,
    pub status: BatchStatus,
    pub total_count: u32,
    pub completed_count: u32,
    pub failed_count: u32,
    pub cancelled_count: u32,
    pub pending_count: u32,
    pub progress_percent: f64,
    pub is_active: bool,
}

impl Batch {
    pub fn new(
        tenant_id: TenantId,
        kind: JobKind,
        total_count: u32,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        if total_count == 0 {
            return Err(DomainError::validation("a batch needs at least one job"));
        }
        Ok(Self {
            id: Uuid::now_v7(),
            batch_id: BatchId::new(),
            tenant_id,
            kind,
            total_count,
            completed_count: 0,
            failed_count: 0,
            cancelled_count: 0,
            status: BatchStatus::Pending,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        })
    }

    pub fn pending_count(&self) -> u32 {
        self.total_count
            .saturating_sub(self.completed_count + self.failed_count + self.cancelled_count)
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total_count == 0 {
            return 0.0;
        }
        let done = (self.completed_count + self.failed_count + self.cancelled_count)
            .min(self.total_count);
        (1000.0 * f64::from(done) / f64::from(self.total_count)).round() / 10.0
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// PENDING → RUNNING when the first child is claimed. No-op otherwise.
    pub fn mark_started(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != BatchStatus::Pending {
            return false;
        }
        self.status = BatchStatus::Running;
        self.started_at = Some(now);
        self.updated_at = now;
        true
    }

    /// Replace the counters with a fresh tally and settle the status.
    ///
    /// Counters never go backwards; a tally lower than the stored counts
    /// (read before a concurrent update landed) is ignored for that counter.
    pub fn apply_tally(&mut self, tally: BatchTally, now: DateTime<Utc>) {
        self.completed_count = self.completed_count.max(tally.succeeded);
        self.failed_count = self.failed_count.max(tally.failed);
        self.cancelled_count = self.cancelled_count.max(tally.cancelled);
        self.updated_at = now;

        if self.is_terminal() || self.pending_count() > 0 {
            return;
        }
        self.status = self.terminal_status();
        self.completed_at = Some(now);
    }

    /// Operator cancellation of a still-active batch.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.is_terminal() {
            return Err(DomainError::illegal_transition(format!(
                "batch {} is already {}",
                self.batch_id, self.status
            )));
        }
        self.status = BatchStatus::Cancelled;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn progress(&self) -> BatchProgress {
        BatchProgress {
            batch_id: self.batch_id,
            status: self.status,
            total_count: self.total_count,
            completed_count: self.completed_count,
            failed_count: self.failed_count,
            cancelled_count: self.cancelled_count,
            pending_count: self.pending_count(),
            progress_percent: self.progress_percent(),
            is_active: self.is_active(),
        }
    }

    /// Outcome once every child is terminal, first matching rule wins.
    fn terminal_status(&self) -> BatchStatus {
        if self.cancelled_count == self.total_count {
            BatchStatus::Cancelled
        } else if self.completed_count == 0 {
            BatchStatus::Failed
        } else if self.completed_count == self.total_count {
            BatchStatus::Completed
        } else if self.failed_count == 0 {
            // Successes mixed only with cancellations: the run was cut short.
            BatchStatus::Cancelled
        } else {
            BatchStatus::PartiallyFailed
        }
    }
}
