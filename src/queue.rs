//! Durable publish job queue backed by the `jobs` table, and its worker pool.
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::db::{self, ClaimOutcome, Pool};
use crate::model::PublishJob;
use crate::orchestrator::Orchestrator;

/// Work performed for one dequeued job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: PublishJob) -> Result<()>;
}

#[async_trait]
impl JobHandler for Orchestrator {
    async fn handle(&self, job: PublishJob) -> Result<()> {
        let results = self.publish(job.owner_id, job.post_id).await?;
        let failed = results.iter().filter(|r| !r.success).count();
        if failed > 0 {
            info!(
                post_id = job.post_id,
                failed,
                total = results.len(),
                "publish job finished with failed destinations"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct JobQueue {
    pool: Pool,
    history_limit: u32,
}

impl JobQueue {
    pub fn new(pool: Pool, history_limit: u32) -> Self {
        Self {
            pool,
            history_limit,
        }
    }

    /// Enqueue a job. Returns false when a job with the same idempotency key is
    /// already queued, running, or retained in history.
    #[instrument(skip(self))]
    pub async fn enqueue(&self, job: PublishJob) -> Result<bool> {
        let id = db::enqueue_job(&self.pool, job, Utc::now()).await?;
        match id {
            Some(id) => {
                info!(job_id = id, key = %job.idempotency_key(), "job enqueued");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Claim a due post and enqueue its job atomically.
    #[instrument(skip(self))]
    pub async fn claim_and_enqueue(&self, job: PublishJob) -> Result<ClaimOutcome> {
        let outcome = db::claim_and_enqueue(&self.pool, job, Utc::now()).await?;
        if let ClaimOutcome::Enqueued(id) = outcome {
            info!(job_id = id, key = %job.idempotency_key(), "job enqueued");
        }
        Ok(outcome)
    }

    /// Claim and run one job. Returns false when the queue was empty.
    #[instrument(skip_all, fields(worker_id = %worker_id))]
    pub async fn process_next_job(&self, worker_id: &str, handler: &dyn JobHandler) -> Result<bool> {
        let Some(job) = db::claim_next_job(&self.pool, worker_id, Utc::now()).await? else {
            return Ok(false);
        };

        match handler.handle(job.job).await {
            Ok(()) => {
                db::complete_job(&self.pool, job.id, Utc::now()).await?;
                info!(job_id = job.id, post_id = job.job.post_id, "job completed");
            }
            Err(err) => {
                // No automatic retry: the job stays failed for inspection.
                warn!(?err, job_id = job.id, post_id = job.job.post_id, "job failed");
                db::fail_job(&self.pool, job.id, &format!("{:#}", err), Utc::now()).await?;
            }
        }

        let pruned = db::prune_finished_jobs(&self.pool, self.history_limit).await?;
        if pruned > 0 {
            info!(pruned, "pruned finished jobs");
        }
        Ok(true)
    }

    /// Re-queue jobs whose worker has been silent for longer than `timeout`.
    pub async fn recover_stalled(&self, timeout: Duration) -> Result<u64> {
        let timeout = chrono::Duration::from_std(timeout)?;
        let recovered = db::requeue_stalled_jobs(&self.pool, Utc::now() - timeout).await?;
        if recovered > 0 {
            warn!(recovered, "re-queued stalled jobs");
        }
        Ok(recovered)
    }

    /// Worker loop: process jobs until `shutdown` flips to true.
    pub async fn run_worker(
        &self,
        worker_id: String,
        handler: Arc<dyn JobHandler>,
        poll_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(%worker_id, "job worker started");
        while !*shutdown.borrow() {
            let idle = match self.process_next_job(&worker_id, handler.as_ref()).await {
                Ok(processed) => !processed,
                Err(err) => {
                    error!(?err, %worker_id, "job worker error");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
        info!(%worker_id, "job worker stopped");
    }
}

/// Run `concurrency` workers against the queue until shutdown.
pub async fn run_worker_pool(
    queue: JobQueue,
    handler: Arc<dyn JobHandler>,
    concurrency: u32,
    poll_interval: Duration,
    shutdown: watch::Receiver<bool>,
) {
    let workers = (0..concurrency).map(|_| {
        let queue = queue.clone();
        let handler = handler.clone();
        let shutdown = shutdown.clone();
        let worker_id = uuid::Uuid::new_v4().to_string();
        async move {
            queue
                .run_worker(worker_id, handler, poll_interval, shutdown)
                .await
        }
    });
    futures::future::join_all(workers).await;
}
