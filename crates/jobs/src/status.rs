//! Status vocabularies for jobs, tasks and batches.
//!
//! The string forms are what the store persists; `FromStr` accepts exactly
//! those forms.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use listingsync_core::DomainError;

macro_rules! impl_status_strings {
    ($t:ident, $name:literal, { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $t {
            pub const ALL: &'static [$t] = &[$($t::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($t::$variant => $s),+
                }
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok($t::$variant),)+
                    other => Err(DomainError::validation(format!(
                        "unknown {} '{}'",
                        $name, other
                    ))),
                }
            }
        }
    };
}

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting to be claimed
    Pending,
    /// Claimed by exactly one worker
    Running,
    /// Finished successfully
    Success,
    /// Failed with retries remaining, waiting for its backoff to elapse
    RetryPending,
    /// Failed with no retries remaining, or non-retryable
    Failed,
    /// Expired, operator-cancelled or shutdown-cancelled
    Cancelled,
}

impl_status_strings!(JobStatus, "job status", {
    Pending => "PENDING",
    Running => "RUNNING",
    Success => "SUCCESS",
    RetryPending => "RETRY_PENDING",
    Failed => "FAILED",
    Cancelled => "CANCELLED",
});

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Status of one step in a job's plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Processing,
    Success,
    Failed,
}

impl_status_strings!(TaskStatus, "task status", {
    Pending => "PENDING",
    Processing => "PROCESSING",
    Success => "SUCCESS",
    Failed => "FAILED",
});

/// Aggregate status of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    PartiallyFailed,
    Failed,
    Cancelled,
}

impl_status_strings!(BatchStatus, "batch status", {
    Pending => "PENDING",
    Running => "RUNNING",
    Completed => "COMPLETED",
    PartiallyFailed => "PARTIALLY_FAILED",
    Failed => "FAILED",
    Cancelled => "CANCELLED",
});

impl BatchStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, BatchStatus::Pending | BatchStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}
