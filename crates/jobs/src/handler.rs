//! The contract marketplace integrations implement, and the registry that
//! routes jobs to them.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::job::Job;
use crate::kind::JobKind;

/// Failure reported by a handler or one of its steps.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Transient (rate limit, timeout, 5xx); the job may be retried.
    #[error("{0}")]
    Retryable(String),
    /// Permanent (validation, 4xx); the job fails immediately.
    #[error("{0}")]
    NonRetryable(String),
}

impl HandlerError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn non_retryable(msg: impl Into<String>) -> Self {
        Self::NonRetryable(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Retryable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            HandlerError::Retryable(msg) | HandlerError::NonRetryable(msg) => msg,
        }
    }
}

pub type StepFuture = BoxFuture<'static, Result<serde_json::Value, HandlerError>>;

/// One named step of a multi-step handler.
pub type StepFn = Arc<dyn Fn(Job) -> StepFuture + Send + Sync>;

/// Step name → step function, consumed by the task orchestrator.
#[derive(Clone, Default)]
pub struct StepHandlers {
    steps: HashMap<String, StepFn>,
}

impl StepHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the function that runs the step called `name`.
    ///
    /// Names are trimmed, matching how `Task::plan` stores descriptions.
    pub fn step<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send + 'static,
    {
        let step: StepFn = Arc::new(move |job: Job| -> StepFuture { Box::pin(f(job)) });
        self.steps.insert(name.into().trim().to_string(), step);
        self
    }

    pub fn get(&self, name: &str) -> Option<&StepFn> {
        self.steps.get(name.trim())
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl std::fmt::Debug for StepHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.steps.keys().collect();
        names.sort();
        f.debug_struct("StepHandlers").field("steps", &names).finish()
    }
}

/// Executes jobs of one (marketplace, action) kind.
///
/// Multi-step handlers return their plan from [`create_tasks`](Self::create_tasks)
/// and a function per step from [`step_handlers`](Self::step_handlers); the
/// orchestrator then persists each step's outcome and skips completed steps on
/// retry. Single-step handlers only implement [`execute`](Self::execute).
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Ordered step names for `job`. Only consulted for multi-step handlers.
    fn create_tasks(&self, _job: &Job) -> Vec<String> {
        Vec::new()
    }

    /// Step functions keyed by the names `create_tasks` returns.
    fn step_handlers(&self) -> Option<StepHandlers> {
        None
    }

    /// Run the whole job in one go.
    async fn execute(&self, job: &Job) -> Result<serde_json::Value, HandlerError> {
        Err(HandlerError::non_retryable(format!(
            "handler for {} has no single-step execution",
            job.kind
        )))
    }
}

/// Resolves a job's kind to its handler. Built once at startup.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `kind`.
    pub fn register<H>(&mut self, kind: JobKind, handler: H) -> &mut Self
    where
        H: JobHandler + 'static,
    {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    pub fn register_arc(&mut self, kind: JobKind, handler: Arc<dyn JobHandler>) -> &mut Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn with<H>(mut self, kind: JobKind, handler: H) -> Self
    where
        H: JobHandler + 'static,
    {
        self.register(kind, handler);
        self
    }

    pub fn resolve(&self, kind: &JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(kind).cloned()
    }

    /// Registered kinds, in a stable order.
    pub fn kinds(&self) -> Vec<JobKind> {
        let ordered: BTreeMap<JobKind, ()> = self.handlers.keys().map(|k| (*k, ())).collect();
        ordered.into_keys().collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<String> = self.kinds().iter().map(ToString::to_string).collect();
        f.debug_struct("HandlerRegistry").field("kinds", &kinds).finish()
    }
}
