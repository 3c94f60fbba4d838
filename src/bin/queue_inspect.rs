use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use postpilot::config;
use postpilot::db;
use postpilot::model::JobState;

#[derive(Debug, Parser)]
#[command(author, version, about = "Print publish job counts and recent jobs")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Print every retained job as JSON lines
    #[arg(long)]
    jobs: bool,
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

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    for state in [
        JobState::Queued,
        JobState::Active,
        JobState::Completed,
        JobState::Failed,
    ] {
        println!("{:<10} {}", state.as_str(), db::count_jobs(&pool, state).await?);
    }

    if args.jobs {
        for job in db::list_jobs(&pool).await? {
            println!("{}", serde_json::to_string(&job)?);
        }
    }
    Ok(())
}
