//! Destination adapter capability and the registry that selects an adapter by
//! destination type.
//!
//! An adapter only knows how to talk to its service: exchange a refresh token
//! and publish with an access token. Everything credential-related that does
//! not depend on the service (expiry buffer, rotation, deactivation, vault
//! handling) lives in [`CredentialManager`] and is combined with an adapter by
//! [`Destination`].

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::config::Config;
use crate::media::ResolvedMedia;
use crate::model::DestinationType;
use crate::vault::Secret;

pub mod credentials;
pub mod http;
pub mod model;

pub use credentials::{CredentialManager, REFRESH_BUFFER_SECS};
pub use http::OAuthHttpAdapter;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("reconnect required for credential {credential_id}: {reason}")]
    ReconnectRequired { credential_id: i64, reason: String },
    #[error("refresh token rejected: {0}")]
    RefreshRejected(String),
    #[error("credential {0} not found")]
    NotFound(i64),
    #[error("destination returned {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("rate limited by destination: {0}")]
    RateLimited(String),
    #[error("invalid destination response: {0}")]
    InvalidResponse(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// New token pair returned by a destination's token endpoint.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: Secret,
    pub refresh_token: Option<Secret>,
    /// Lifetime in seconds; `None` means the destination did not say.
    pub expires_in: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct PublishOptions {
    /// Sent as `Idempotency-Key` to destinations that honour it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct PublishRequest<'a> {
    pub content: &'a str,
    pub media: &'a [ResolvedMedia],
    pub options: &'a PublishOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedPost {
    pub external_id: String,
    pub url: String,
}

#[async_trait]
pub trait DestinationAdapter: Send + Sync {
    fn destination(&self) -> DestinationType;

    async fn exchange_refresh_token(&self, refresh_token: &Secret) -> Result<TokenGrant, AdapterError>;

    async fn publish_with_token(
        &self,
        access_token: &Secret,
        request: PublishRequest<'_>,
    ) -> Result<PublishedPost, AdapterError>;
}

/// One adapter bound to the shared credential store.
#[derive(Clone)]
pub struct Destination {
    adapter: Arc<dyn DestinationAdapter>,
    credentials: CredentialManager,
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Destination")
            .field("kind", &self.adapter.destination())
            .finish_non_exhaustive()
    }
}

impl Destination {
    pub fn new(adapter: Arc<dyn DestinationAdapter>, credentials: CredentialManager) -> Self {
        Self {
            adapter,
            credentials,
        }
    }

    /// Usable access token, refreshed first when it expires within the buffer.
    pub async fn get_valid_credential(&self, credential_id: i64) -> Result<Secret, AdapterError> {
        self.credentials
            .get_valid_credential(self.adapter.as_ref(), credential_id)
            .await
    }

    pub async fn refresh_credential(&self, credential_id: i64) -> Result<Secret, AdapterError> {
        self.credentials
            .refresh_credential(self.adapter.as_ref(), credential_id)
            .await
    }

    pub async fn publish(
        &self,
        credential_id: i64,
        content: &str,
        media: &[ResolvedMedia],
        options: &PublishOptions,
    ) -> Result<PublishedPost, AdapterError> {
        let token = self.get_valid_credential(credential_id).await?;
        self.adapter
            .publish_with_token(
                &token,
                PublishRequest {
                    content,
                    media,
                    options,
                },
            )
            .await
    }
}

/// Lookup table from destination type to its adapter.
#[derive(Clone)]
pub struct DestinationRegistry {
    adapters: HashMap<DestinationType, Arc<dyn DestinationAdapter>>,
    credentials: CredentialManager,
}

impl fmt::Debug for DestinationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.adapters.keys().map(|k| k.as_str()).collect();
        kinds.sort_unstable();
        f.debug_struct("DestinationRegistry")
            .field("adapters", &kinds)
            .finish_non_exhaustive()
    }
}

impl DestinationRegistry {
    pub fn new(credentials: CredentialManager) -> Self {
        Self {
            adapters: HashMap::new(),
            credentials,
        }
    }

    /// Build one HTTP adapter per configured destination.
    pub fn from_config(cfg: &Config, credentials: CredentialManager) -> Result<Self> {
        let mut registry = Self::new(credentials);
        for dest in &cfg.destinations {
            registry.register(Arc::new(OAuthHttpAdapter::from_config(dest)?));
        }
        Ok(registry)
    }

    /// Register an adapter, replacing any previous one for the same type.
    pub fn register(&mut self, adapter: Arc<dyn DestinationAdapter>) {
        self.adapters.insert(adapter.destination(), adapter);
    }

    pub fn get(&self, kind: DestinationType) -> Option<Destination> {
        self.adapters
            .get(&kind)
            .map(|adapter| Destination::new(adapter.clone(), self.credentials.clone()))
    }
}
