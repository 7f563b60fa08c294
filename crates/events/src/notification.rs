//! The job-change notification payload.

use serde::{Deserialize, Serialize};

use listingsync_core::{JobId, TenantId};

use crate::tenant::TenantScoped;

/// "Job `job_id` of `tenant` may now be claimable."
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobNotification {
    pub job_id: JobId,
    pub tenant: TenantId,
}

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("malformed notification payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl JobNotification {
    pub fn new(job_id: JobId, tenant: TenantId) -> Self {
        Self { job_id, tenant }
    }

    /// Parse the JSON payload published by the store trigger.
    pub fn from_payload(payload: &str) -> Result<Self, NotificationError> {
        Ok(serde_json::from_str(payload)?)
    }

    pub fn to_payload(&self) -> Result<String, NotificationError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl TenantScoped for JobNotification {
    fn tenant_id(&self) -> TenantId {
        self.tenant
    }
}
