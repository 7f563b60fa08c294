use clap::Parser;
use tracing::info;

use listingsync_jobs::HandlerRegistry;
use listingsync_worker::{Cli, dry_run};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    listingsync_observability::init_with(cli.log_format);

    let registry = if cli.dry_run {
        dry_run::registry()
    } else {
        HandlerRegistry::new()
    };

    let exit = listingsync_worker::run(cli, registry).await?;
    info!(
        reason = ?exit.reason,
        jobs_claimed = exit.jobs_claimed,
        uptime_secs = exit.uptime.as_secs(),
        "worker exited"
    );
    Ok(())
}
