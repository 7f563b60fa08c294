//! Worker configuration: raw settings in, validated config out.
//!
//! Every bad value is rejected at startup. Nothing is clamped.

use std::time::Duration;

use listingsync_core::TenantId;
use listingsync_events::TenantScope;
use listingsync_jobs::{BackoffStrategy, Marketplace, RetryPolicy};

use crate::jobs::{ClaimFilter, ExecutorSettings};

pub const DEFAULT_NOTIFY_CHANNEL: &str = "listingsync_jobs";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("max concurrency must be at least 1, got {0}")]
    MaxConcurrency(usize),
    #[error("per-tenant concurrency must be at least 1, got {0}")]
    PerTenantConcurrency(usize),
    #[error("per-tenant concurrency ({per_tenant}) exceeds max concurrency ({global})")]
    PerTenantExceedsGlobal { per_tenant: usize, global: usize },
    #[error("worker idle timeout must be positive, got {0}h")]
    IdleTimeout(f64),
    #[error("worker max age must be positive, got {0}h")]
    MaxAge(f64),
    #[error("poll interval must be positive, got {0}s")]
    PollInterval(f64),
    #[error("job timeout must be at least one second")]
    JobTimeout,
    #[error("database url is empty")]
    EmptyDatabaseUrl,
    #[error("unknown marketplace '{0}'")]
    UnknownMarketplace(String),
    #[error("invalid tenant id '{0}'")]
    InvalidTenant(String),
    #[error("notification channel name is empty")]
    EmptyNotifyChannel,
    #[error("retry delay must not be negative, got {0}s")]
    RetryDelay(f64),
    #[error("retry base delay ({base}s) exceeds retry max delay ({max}s)")]
    RetryBaseExceedsMax { base: f64, max: f64 },
    #[error("database pool needs at least one connection")]
    MaxConnections,
}

/// Raw, unvalidated worker settings as read from flags or the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    pub worker_name: String,
    pub max_concurrency: usize,
    pub per_tenant_concurrency: usize,
    pub idle_timeout_hours: f64,
    pub max_age_hours: f64,
    pub poll_interval_secs: f64,
    pub job_timeout_secs: u64,
    pub graceful_shutdown_secs: u64,
    pub database_url: String,
    pub max_connections: u32,
    /// Empty means every marketplace.
    pub marketplaces: Vec<String>,
    pub tenant: Option<String>,
    pub notify_channel: String,
    pub retry_base_delay_secs: f64,
    pub retry_max_delay_secs: f64,
    pub cancel_pending_on_shutdown: bool,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            worker_name: "listingsync-worker".to_string(),
            max_concurrency: 10,
            per_tenant_concurrency: 3,
            idle_timeout_hours: 1.0,
            max_age_hours: 24.0,
            poll_interval_secs: 5.0,
            job_timeout_secs: 900,
            graceful_shutdown_secs: 30,
            database_url: String::new(),
            max_connections: 5,
            marketplaces: Vec::new(),
            tenant: None,
            notify_channel: DEFAULT_NOTIFY_CHANNEL.to_string(),
            retry_base_delay_secs: 5.0,
            retry_max_delay_secs: 300.0,
            cancel_pending_on_shutdown: false,
        }
    }
}

/// Validated worker configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub worker_name: String,
    pub max_concurrency: usize,
    pub per_tenant_concurrency: usize,
    pub idle_timeout: Duration,
    pub max_age: Duration,
    pub poll_interval: Duration,
    pub job_timeout: Duration,
    pub graceful_shutdown: Duration,
    pub database_url: String,
    pub max_connections: u32,
    /// `None` means every marketplace.
    pub marketplaces: Option<Vec<Marketplace>>,
    pub scope: TenantScope,
    pub notify_channel: String,
    pub retry_policy: RetryPolicy,
    pub cancel_pending_on_shutdown: bool,
}

impl WorkerConfig {
    pub fn from_settings(settings: WorkerSettings) -> Result<Self, ConfigError> {
        if settings.max_concurrency < 1 {
            return Err(ConfigError::MaxConcurrency(settings.max_concurrency));
        }
        if settings.per_tenant_concurrency < 1 {
            return Err(ConfigError::PerTenantConcurrency(
                settings.per_tenant_concurrency,
            ));
        }
        if settings.per_tenant_concurrency > settings.max_concurrency {
            return Err(ConfigError::PerTenantExceedsGlobal {
                per_tenant: settings.per_tenant_concurrency,
                global: settings.max_concurrency,
            });
        }

        let idle_timeout = positive_secs(settings.idle_timeout_hours * 3600.0)
            .ok_or(ConfigError::IdleTimeout(settings.idle_timeout_hours))?;
        let max_age = positive_secs(settings.max_age_hours * 3600.0)
            .ok_or(ConfigError::MaxAge(settings.max_age_hours))?;
        let poll_interval = positive_secs(settings.poll_interval_secs)
            .ok_or(ConfigError::PollInterval(settings.poll_interval_secs))?;
        if settings.job_timeout_secs == 0 {
            return Err(ConfigError::JobTimeout);
        }

        if settings.database_url.trim().is_empty() {
            return Err(ConfigError::EmptyDatabaseUrl);
        }
        if settings.max_connections == 0 {
            return Err(ConfigError::MaxConnections);
        }

        let marketplaces = if settings.marketplaces.is_empty() {
            None
        } else {
            let mut parsed = Vec::with_capacity(settings.marketplaces.len());
            for raw in &settings.marketplaces {
                let m: Marketplace = raw
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::UnknownMarketplace(raw.clone()))?;
                if !parsed.contains(&m) {
                    parsed.push(m);
                }
            }
            Some(parsed)
        };

        let scope = match settings.tenant.as_deref().map(str::trim) {
            None | Some("") => TenantScope::Any,
            Some(raw) => TenantScope::Tenant(
                raw.parse::<TenantId>()
                    .map_err(|_| ConfigError::InvalidTenant(raw.to_string()))?,
            ),
        };

        if settings.notify_channel.trim().is_empty() {
            return Err(ConfigError::EmptyNotifyChannel);
        }

        let base_delay = non_negative_secs(settings.retry_base_delay_secs)
            .ok_or(ConfigError::RetryDelay(settings.retry_base_delay_secs))?;
        let max_delay = non_negative_secs(settings.retry_max_delay_secs)
            .ok_or(ConfigError::RetryDelay(settings.retry_max_delay_secs))?;
        if base_delay > max_delay {
            return Err(ConfigError::RetryBaseExceedsMax {
                base: settings.retry_base_delay_secs,
                max: settings.retry_max_delay_secs,
            });
        }

        Ok(Self {
            worker_name: settings.worker_name,
            max_concurrency: settings.max_concurrency,
            per_tenant_concurrency: settings.per_tenant_concurrency,
            idle_timeout,
            max_age,
            poll_interval,
            job_timeout: Duration::from_secs(settings.job_timeout_secs),
            graceful_shutdown: Duration::from_secs(settings.graceful_shutdown_secs),
            database_url: settings.database_url,
            max_connections: settings.max_connections,
            marketplaces,
            scope,
            notify_channel: settings.notify_channel.trim().to_string(),
            retry_policy: RetryPolicy {
                base_delay,
                max_delay,
                strategy: BackoffStrategy::Exponential,
                ..RetryPolicy::default()
            },
            cancel_pending_on_shutdown: settings.cancel_pending_on_shutdown,
        })
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings::default()
            .with_name(self.worker_name.clone())
            .with_job_timeout(self.job_timeout)
            .with_retry_policy(self.retry_policy.clone())
    }

    /// Base claim filter: the worker's tenant scope and marketplace filter.
    pub fn claim_filter(&self) -> ClaimFilter {
        ClaimFilter {
            marketplaces: self.marketplaces.clone(),
            ..ClaimFilter::for_scope(self.scope)
        }
    }
}

fn positive_secs(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|d| !d.is_zero())
}

fn non_negative_secs(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok()
}
