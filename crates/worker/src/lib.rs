//! `listingsync-worker`: wires configuration, Postgres and a handler
//! registry into a running job worker.

pub mod cli;
pub mod dry_run;

use std::sync::Arc;

use anyhow::{Context, bail};
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use listingsync_infra::jobs::{JobExecutor, PostgresJobStore, migrate};
use listingsync_infra::notify::PgNotificationBus;
use listingsync_infra::workers::{Worker, WorkerExit};
use listingsync_infra::WorkerConfig;
use listingsync_jobs::HandlerRegistry;

pub use cli::Cli;

/// Run one worker until it shuts down or retires.
///
/// SIGINT/SIGTERM start a graceful drain.
pub async fn run(cli: Cli, registry: HandlerRegistry) -> anyhow::Result<WorkerExit> {
    let config =
        WorkerConfig::from_settings(cli.settings()).context("invalid worker configuration")?;
    if registry.is_empty() {
        bail!("no job handlers registered (use --dry-run to run with logging handlers)");
    }

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;
    if cli.migrate {
        migrate(&pool).await.context("failed to run migrations")?;
        info!("migrations applied");
    }

    info!(
        worker = %config.worker_name,
        kinds = registry.len(),
        channel = %config.notify_channel,
        "starting worker"
    );
    let store = Arc::new(PostgresJobStore::new(pool.clone()));
    let bus = PgNotificationBus::new(pool, config.notify_channel.clone());
    let executor = Arc::new(JobExecutor::new(store, registry, config.executor_settings()));
    let worker = Worker::new(config, executor, bus);

    let handle = worker.handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        handle.shutdown();
    });

    Ok(worker.run().await)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "could not listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
