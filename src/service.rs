//! Wires the publishing pipeline together from a loaded [`Config`].
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use crate::audit::{AuditSink, TracingAuditSink};
use crate::config::Config;
use crate::db::{self, Pool};
use crate::destination::{CredentialManager, DestinationRegistry};
use crate::media::{LocalMediaResolver, MediaResolver};
use crate::orchestrator::Orchestrator;
use crate::queue::{self, JobHandler, JobQueue};
use crate::scanner::Scanner;
use crate::vault::Vault;

pub struct Services {
    pub orchestrator: Arc<Orchestrator>,
    pub queue: JobQueue,
    pub scanner: Scanner,
}

impl Services {
    /// Open the database, run migrations, and build every component.
    pub async fn connect(cfg: &Config) -> Result<Self> {
        let pool = db::init_pool(&cfg.database_url()).await?;
        db::run_migrations(&pool).await?;
        let vault = Vault::from_env(&cfg.vault.key_env)?;
        Self::build(cfg, pool, vault)
    }

    pub fn build(cfg: &Config, pool: Pool, vault: Vault) -> Result<Self> {
        let credentials = CredentialManager::new(pool.clone(), vault);
        let registry = Arc::new(DestinationRegistry::from_config(cfg, credentials)?);
        let media: Arc<dyn MediaResolver> = Arc::new(LocalMediaResolver::from_config(&cfg.media)?);
        let audit: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);
        info!(?registry, "destinations configured");

        let orchestrator = Arc::new(Orchestrator::new(pool.clone(), registry, media, audit));
        let queue = JobQueue::new(pool.clone(), cfg.app.job_history_limit);
        let scanner = Scanner::new(pool, queue.clone());
        Ok(Self {
            orchestrator,
            queue,
            scanner,
        })
    }

    /// Run the scanner and worker pool until `shutdown` flips to true.
    pub async fn run(&self, cfg: &Config, shutdown: watch::Receiver<bool>) -> Result<()> {
        self.queue
            .recover_stalled(Duration::from_secs(cfg.app.stalled_job_timeout_seconds))
            .await?;

        let handler: Arc<dyn JobHandler> = self.orchestrator.clone();
        let workers = queue::run_worker_pool(
            self.queue.clone(),
            handler,
            cfg.app.worker_concurrency,
            Duration::from_millis(cfg.app.job_poll_interval_ms),
            shutdown.clone(),
        );
        let scanner = self.scanner.run_periodic(
            Duration::from_millis(cfg.app.scan_interval_ms),
            cfg.app.scan_batch_limit,
            shutdown,
        );
        tokio::join!(workers, scanner);
        Ok(())
    }
}
