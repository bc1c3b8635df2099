use anyhow::{Context, Result};
use strand_worker::{programs, StrandWorker, WorkerSettings};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present; real environment variables win
    dotenvy::dotenv().ok();

    // Configure via RUST_LOG (default: "strand_worker=debug,strand_engine=info")
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("strand_worker=debug,strand_engine=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    tracing::info!("strand-worker starting...");

    let settings = WorkerSettings::from_env().context("Invalid worker configuration")?;

    tracing::info!(
        worker_id = %settings.worker_id,
        max_concurrency = settings.max_concurrency,
        lease_ttl_secs = settings.lease_ttl.as_secs(),
        persistent = settings.database_url.is_some(),
        "Starting strand worker"
    );

    let worker = StrandWorker::connect(&settings)
        .await
        .context("Failed to create strand worker")?;

    if let Some(children) = settings.demo_fanout {
        let id = worker
            .client()
            .assemble(programs::fanout::NAME, programs::fanout::frame(children.into()))
            .await
            .context("Failed to assemble demo strand")?;
        tracing::info!(strand_id = %id, children, "Assembled demo fanout strand");
    }

    worker.start().await?;

    // Run until Ctrl-C
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    if let Err(e) = worker.shutdown().await {
        tracing::error!(error = %e, "Worker did not shut down cleanly");
        return Err(e);
    }

    tracing::info!("Worker shutdown complete");
    Ok(())
}
