use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{error, info};

use postpilot::config;
use postpilot::service::Services;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let services = Services::connect(&cfg).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(?err, "failed to listen for ctrl-c");
        }
        info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    info!(
        workers = cfg.app.worker_concurrency,
        scan_interval_ms = cfg.app.scan_interval_ms,
        "starting publishing engine"
    );
    services.run(&cfg, shutdown_rx).await?;
    info!("publishing engine stopped");
    Ok(())
}
