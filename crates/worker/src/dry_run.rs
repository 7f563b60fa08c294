//! Handlers that only log, for exercising a deployment end to end without
//! touching any marketplace.

use async_trait::async_trait;
use tracing::info;

use listingsync_jobs::{
    ActionCode, HandlerError, HandlerRegistry, Job, JobHandler, JobKind, Marketplace,
    StepHandlers,
};

const STEPS: [&str; 2] = ["validate", "submit"];

#[derive(Debug, Default)]
pub struct LoggingHandler;

#[async_trait]
impl JobHandler for LoggingHandler {
    fn create_tasks(&self, _job: &Job) -> Vec<String> {
        STEPS.iter().map(|s| s.to_string()).collect()
    }

    fn step_handlers(&self) -> Option<StepHandlers> {
        let mut steps = StepHandlers::new();
        for step in STEPS {
            steps = steps.step(step, move |job: Job| async move {
                info!(
                    job_id = %job.id,
                    kind = %job.kind,
                    product_id = %job.product_id,
                    step,
                    "dry run"
                );
                Ok::<_, HandlerError>(serde_json::json!({ "dry_run": true }))
            });
        }
        Some(steps)
    }
}

/// A registry with `LoggingHandler` behind every marketplace and action.
pub fn registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    for marketplace in Marketplace::ALL {
        for action in ActionCode::ALL {
            registry.register(JobKind::new(marketplace, action), LoggingHandler);
        }
    }
    registry
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use listingsync_core::TenantId;
    use listingsync_jobs::NewJob;

    #[test]
    fn covers_every_kind() {
        assert_eq!(registry().len(), Marketplace::ALL.len() * ActionCode::ALL.len());
    }

    #[tokio::test]
    async fn steps_succeed() {
        let kind = JobKind::new(Marketplace::Ebay, ActionCode::Update);
        let job = Job::new(NewJob::new(TenantId::new(), kind, "sku-1"), Utc::now()).unwrap();
        let handler = registry().resolve(&kind).unwrap();
        let steps = handler.step_handlers().unwrap();
        for name in handler.create_tasks(&job) {
            let step = steps.get(&name).unwrap();
            assert!(step(job.clone()).await.is_ok());
        }
    }
}
