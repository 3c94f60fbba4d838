use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use postpilot::config;
use postpilot::service::Services;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Publish one post immediately to all of its linked destinations"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Owner of the post
    #[arg(long)]
    owner_id: i64,

    /// Post to publish
    #[arg(long)]
    post_id: i64,
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
    let results = services
        .orchestrator
        .publish(args.owner_id, args.post_id)
        .await?;

    let failed = results.iter().filter(|r| !r.success).count();
    info!(post_id = args.post_id, total = results.len(), failed, "publish finished");
    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}
