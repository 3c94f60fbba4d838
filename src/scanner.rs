//! Due-item scanner: claims scheduled posts whose time has come and enqueues
//! a publish job for each claim.
use anyhow::Result;
use chrono::Utc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::db::{self, ClaimOutcome, DuePost, Pool};
use crate::model::PublishJob;
use crate::queue::JobQueue;

#[derive(Debug, Clone)]
pub struct Scanner {
    pool: Pool,
    queue: JobQueue,
}

impl Scanner {
    pub fn new(pool: Pool, queue: JobQueue) -> Self {
        Self { pool, queue }
    }

    /// Claim up to `limit` due posts. Safe to run from any number of
    /// concurrent instances; each post is claimed by at most one of them.
    /// Returns the number of posts claimed and enqueued by this call.
    #[instrument(skip(self))]
    pub async fn scan_and_claim(&self, limit: u32) -> Result<usize> {
        let now = Utc::now();
        let candidates = db::list_due_posts(&self.pool, now, limit).await?;
        let mut claimed = 0;
        for candidate in candidates {
            match self.claim_and_enqueue(candidate).await {
                Ok(true) => claimed += 1,
                Ok(false) => debug!(post_id = candidate.id, "already claimed elsewhere"),
                Err(err) => {
                    warn!(?err, post_id = candidate.id, "failed to claim due post; continuing")
                }
            }
        }
        if claimed > 0 {
            info!(claimed, "claimed due posts");
        }
        Ok(claimed)
    }

    async fn claim_and_enqueue(&self, candidate: DuePost) -> Result<bool> {
        let job = PublishJob::new(candidate.id, candidate.owner_id);
        match self.queue.claim_and_enqueue(job).await? {
            ClaimOutcome::Lost => Ok(false),
            ClaimOutcome::Enqueued(_) => Ok(true),
            ClaimOutcome::Deduplicated => {
                warn!(
                    post_id = candidate.id,
                    key = %job.idempotency_key(),
                    "publish job already present; enqueue deduplicated"
                );
                Ok(true)
            }
        }
    }

    /// Periodic trigger: scan every `interval` until `shutdown` flips to true.
    pub async fn run_periodic(
        &self,
        interval: Duration,
        limit: u32,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(err) = self.scan_and_claim(limit).await {
                error!(?err, "scan failed");
            }
        }
        info!("scanner stopped");
    }
}
