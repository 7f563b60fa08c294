//! Command-line flags with environment fallbacks.

use clap::Parser;

use listingsync_infra::WorkerSettings;
use listingsync_infra::config::DEFAULT_NOTIFY_CHANNEL;
use listingsync_observability::LogFormat;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "listingsync-worker",
    about = "Claims and runs marketplace listing jobs",
    version
)]
pub struct Cli {
    /// Name used in logs
    #[arg(long, env = "LISTINGSYNC_WORKER_NAME", default_value = "listingsync-worker")]
    pub worker_name: String,

    /// Jobs executing at once in this process
    #[arg(long, env = "LISTINGSYNC_MAX_CONCURRENCY", default_value_t = 10)]
    pub max_concurrency: usize,

    /// Jobs of one tenant executing at once in this process
    #[arg(long, env = "LISTINGSYNC_PER_TENANT_CONCURRENCY", default_value_t = 3)]
    pub per_tenant_concurrency: usize,

    /// Retire after this many hours without claiming a job
    #[arg(long, env = "LISTINGSYNC_WORKER_IDLE_TIMEOUT_HOURS", default_value_t = 1.0)]
    pub idle_timeout_hours: f64,

    /// Retire after this many hours regardless of activity
    #[arg(long, env = "LISTINGSYNC_WORKER_MAX_AGE_HOURS", default_value_t = 24.0)]
    pub max_age_hours: f64,

    /// Fallback poll when no notification arrives
    #[arg(long, env = "LISTINGSYNC_POLL_INTERVAL_SECS", default_value_t = 5.0)]
    pub poll_interval_secs: f64,

    /// A running job older than this is presumed orphaned
    #[arg(long, env = "LISTINGSYNC_JOB_TIMEOUT_SECS", default_value_t = 900)]
    pub job_timeout_secs: u64,

    /// How long to wait for in-flight jobs on shutdown
    #[arg(long, env = "LISTINGSYNC_GRACEFUL_SHUTDOWN_SECS", default_value_t = 30)]
    pub graceful_shutdown_secs: u64,

    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: String,

    #[arg(long, env = "LISTINGSYNC_MAX_CONNECTIONS", default_value_t = 5)]
    pub max_connections: u32,

    /// Only claim jobs for these marketplaces (default: all)
    #[arg(
        long = "marketplace",
        env = "LISTINGSYNC_MARKETPLACES",
        value_delimiter = ','
    )]
    pub marketplaces: Vec<String>,

    /// Only claim jobs of this tenant (default: any tenant)
    #[arg(long, env = "LISTINGSYNC_TENANT")]
    pub tenant: Option<String>,

    #[arg(long, env = "LISTINGSYNC_NOTIFY_CHANNEL", default_value = DEFAULT_NOTIFY_CHANNEL)]
    pub notify_channel: String,

    #[arg(long, env = "LISTINGSYNC_RETRY_BASE_DELAY_SECS", default_value_t = 5.0)]
    pub retry_base_delay_secs: f64,

    #[arg(long, env = "LISTINGSYNC_RETRY_MAX_DELAY_SECS", default_value_t = 300.0)]
    pub retry_max_delay_secs: f64,

    /// Cancel unclaimed jobs in this worker's scope when shutting down
    #[arg(long, env = "LISTINGSYNC_CANCEL_PENDING_ON_SHUTDOWN")]
    pub cancel_pending_on_shutdown: bool,

    /// Apply database migrations before starting
    #[arg(long)]
    pub migrate: bool,

    #[arg(long, env = "LISTINGSYNC_LOG_FORMAT", default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,

    /// Register logging handlers for every job kind instead of real ones
    #[arg(long)]
    pub dry_run: bool,
}

impl Cli {
    pub fn settings(&self) -> WorkerSettings {
        WorkerSettings {
            worker_name: self.worker_name.clone(),
            max_concurrency: self.max_concurrency,
            per_tenant_concurrency: self.per_tenant_concurrency,
            idle_timeout_hours: self.idle_timeout_hours,
            max_age_hours: self.max_age_hours,
            poll_interval_secs: self.poll_interval_secs,
            job_timeout_secs: self.job_timeout_secs,
            graceful_shutdown_secs: self.graceful_shutdown_secs,
            database_url: self.database_url.clone(),
            max_connections: self.max_connections,
            marketplaces: self.marketplaces.clone(),
            tenant: self.tenant.clone(),
            notify_channel: self.notify_channel.clone(),
            retry_base_delay_secs: self.retry_base_delay_secs,
            retry_max_delay_secs: self.retry_max_delay_secs,
            cancel_pending_on_shutdown: self.cancel_pending_on_shutdown,
        }
    }
}
