//! Ordered steps of a job's execution plan.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use listingsync_core::{DomainError, DomainResult, JobId, TaskId};

use crate::status::TaskStatus;

/// One step of a job's plan.
///
/// Created once on a job's first attempt and mutated in place afterwards, so
/// a retry knows which steps already succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub job_id: JobId,
    /// 1-based and dense within a job.
    pub position: u32,
    pub description: String,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

impl Task {
    pub fn new(job_id: JobId, position: u32, description: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            job_id,
            position,
            description: description.into(),
            status: TaskStatus::Pending,
            started_at: None,
            completed_at: None,
            result: None,
            error_message: None,
        }
    }

    /// Build the pending plan for `job_id`, positions `1..=steps.len()`.
    pub fn plan<S: AsRef<str>>(job_id: JobId, steps: &[S]) -> DomainResult<Vec<Task>> {
        if steps.is_empty() {
            return Err(DomainError::validation("task plan must not be empty"));
        }
        steps
            .iter()
            .enumerate()
            .map(|(idx, step)| {
                let name = step.as_ref().trim();
                if name.is_empty() {
                    return Err(DomainError::validation(format!(
                        "task {} has an empty description",
                        idx + 1
                    )));
                }
                let position = u32::try_from(idx + 1)
                    .map_err(|_| DomainError::validation("task plan is too long"))?;
                Ok(Task::new(job_id, position, name))
            })
            .collect()
    }

    /// Whether a later attempt must run this step again.
    pub fn needs_run(&self) -> bool {
        self.status != TaskStatus::Success
    }

    pub fn start(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Processing;
        self.started_at = Some(now);
        self.completed_at = None;
        self.error_message = None;
    }

    pub fn succeed(&mut self, result: serde_json::Value, now: DateTime<Utc>) {
        self.status = TaskStatus::Success;
        self.result = Some(result);
        self.error_message = None;
        self.completed_at = Some(now);
    }

    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.status = TaskStatus::Failed;
        self.error_message = Some(error.into());
        self.completed_at = Some(now);
    }
}
