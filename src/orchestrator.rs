//! Publishes one post to every linked destination and records the outcome.
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::aggregate::aggregate;
use crate::audit::{AuditEvent, AuditSink};
use crate::db::{self, LinkForPublish, Pool};
use crate::destination::{
    AdapterError, Destination, DestinationRegistry, PublishOptions, PublishedPost,
};
use crate::media::{MediaResolver, ResolvedMedia};
use crate::model::{DestinationResult, DestinationType, LinkStatus, PostStatus};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("post {0} not found")]
    NotFound(i64),
    #[error("post {post_id} does not belong to owner {owner_id}")]
    WrongOwner { post_id: i64, owner_id: i64 },
    #[error("post {post_id} cannot be published from status {status}")]
    InvalidState { post_id: i64, status: PostStatus },
    #[error("post {0} has no linked destinations")]
    NoDestinations(i64),
    #[error("destination {0} is not configured")]
    NotConfigured(DestinationType),
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

pub struct Orchestrator {
    pool: Pool,
    registry: Arc<DestinationRegistry>,
    media: Arc<dyn MediaResolver>,
    audit: Arc<dyn AuditSink>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(
        pool: Pool,
        registry: Arc<DestinationRegistry>,
        media: Arc<dyn MediaResolver>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            pool,
            registry,
            media,
            audit,
        }
    }

    /// Publish `post_id` for `owner_id`, one destination at a time.
    ///
    /// Precondition failures return an error before anything is written. Once
    /// dispatch starts, every linked destination gets exactly one result and
    /// per-destination failures are reported in that result, not as an error.
    #[instrument(skip(self))]
    pub async fn publish(
        &self,
        owner_id: i64,
        post_id: i64,
    ) -> Result<Vec<DestinationResult>, PublishError> {
        let post = db::fetch_post_for_publish(&self.pool, post_id)
            .await?
            .ok_or(PublishError::NotFound(post_id))?;
        if post.owner_id != owner_id {
            return Err(PublishError::WrongOwner { post_id, owner_id });
        }
        if !post.status.is_publishable() {
            return Err(PublishError::InvalidState {
                post_id,
                status: post.status,
            });
        }

        let links = db::fetch_links_for_publish(&self.pool, post_id).await?;
        if links.is_empty() {
            return Err(PublishError::NoDestinations(post_id));
        }
        let targets = links
            .into_iter()
            .map(|link| {
                let destination = self
                    .registry
                    .get(link.destination)
                    .ok_or(PublishError::NotConfigured(link.destination))?;
                Ok((link, destination))
            })
            .collect::<Result<Vec<_>, PublishError>>()?;

        let media = self.resolve_media(post_id).await?;

        if post.status != PostStatus::Publishing
            && !db::mark_post_publishing(&self.pool, post_id, Utc::now()).await?
        {
            let status = db::fetch_post(&self.pool, post_id)
                .await?
                .map_or(post.status, |p| p.status);
            warn!(post_id, %status, "post changed state before dispatch; not publishing");
            return Err(PublishError::InvalidState { post_id, status });
        }

        let mut results = Vec::with_capacity(targets.len());
        for (link, destination) in &targets {
            let content = link.custom_content.as_deref().unwrap_or(&post.content);
            let outcome = self
                .publish_link(post_id, link, destination, content, &media)
                .await;

            let result = match outcome {
                Ok(published) => {
                    db::record_link_success(
                        &self.pool,
                        link.link_id,
                        &published.external_id,
                        &published.url,
                        Utc::now(),
                    )
                    .await?;
                    DestinationResult {
                        link_id: link.link_id,
                        credential_id: link.credential_id,
                        destination: link.destination,
                        success: true,
                        external_url: Some(published.url),
                        error: None,
                    }
                }
                Err(message) => {
                    warn!(post_id, link_id = link.link_id, destination = %link.destination, %message, "destination failed");
                    db::record_link_failure(&self.pool, link.link_id, &message).await?;
                    DestinationResult {
                        link_id: link.link_id,
                        credential_id: link.credential_id,
                        destination: link.destination,
                        success: false,
                        external_url: None,
                        error: Some(message),
                    }
                }
            };
            results.push(result);
        }

        let outcomes = results.iter().map(|r| {
            if r.success {
                LinkStatus::Published
            } else {
                LinkStatus::Failed
            }
        });
        let status = aggregate(outcomes).unwrap_or(PostStatus::Failed);
        let now = Utc::now();
        let published_at = (status != PostStatus::Failed).then_some(now);
        db::finish_post(&self.pool, post_id, status, published_at, now).await?;

        let succeeded = results.iter().filter(|r| r.success).count();
        info!(post_id, %status, succeeded, failed = results.len() - succeeded, "publish finished");
        self.audit.record(AuditEvent::PostPublished {
            post_id,
            owner_id,
            status,
            succeeded,
            failed: results.len() - succeeded,
        });

        Ok(results)
    }

    /// One destination attempt. Errors come back as the message stored on the link.
    async fn publish_link(
        &self,
        post_id: i64,
        link: &LinkForPublish,
        destination: &Destination,
        content: &str,
        media: &Result<Vec<ResolvedMedia>, String>,
    ) -> Result<PublishedPost, String> {
        if !link.credential_active {
            self.audit.record(AuditEvent::CredentialNeedsReconnect {
                post_id,
                credential_id: link.credential_id,
            });
            return Err(format!(
                "reconnect required: {} credential is inactive",
                link.destination
            ));
        }
        let media = media.as_ref().map_err(|err| err.clone())?;
        let options = PublishOptions {
            idempotency_key: Some(format!("post-{}-link-{}", post_id, link.link_id)),
        };

        match destination
            .publish(link.credential_id, content, media, &options)
            .await
        {
            Ok(published) => Ok(published),
            Err(err @ AdapterError::ReconnectRequired { .. }) => {
                self.audit.record(AuditEvent::CredentialNeedsReconnect {
                    post_id,
                    credential_id: link.credential_id,
                });
                Err(err.to_string())
            }
            Err(err) => Err(err.to_string()),
        }
    }

    /// Resolve attachments once per post. A resolution failure is reported on
    /// every link rather than aborting the attempt.
    async fn resolve_media(&self, post_id: i64) -> Result<Result<Vec<ResolvedMedia>, String>, PublishError> {
        let attachments = db::list_media_for_post(&self.pool, post_id).await?;
        let mut resolved = Vec::with_capacity(attachments.len());
        for attachment in &attachments {
            match self.media.resolve(attachment).await {
                Ok(media) => resolved.push(media),
                Err(err) => {
                    warn!(post_id, media_id = attachment.id, ?err, "media resolution failed");
                    return Ok(Err(format!("media unavailable: {:#}", err)));
                }
            }
        }
        Ok(Ok(resolved))
    }
}
