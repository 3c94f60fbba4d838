//! Generic OAuth2 + JSON REST adapter.
//!
//! Refresh is the standard `grant_type=refresh_token` form POST. Publishing is
//! a JSON POST of `{"text", "media"}` with a bearer token, answered by
//! `{"id", "url"}`.
use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use std::fmt;
use tracing::{debug, info, warn};

use super::model::{MediaBody, PublishBody, PublishResponse, TokenResponse};
use super::{AdapterError, DestinationAdapter, PublishRequest, PublishedPost, TokenGrant};
use crate::config;
use crate::model::DestinationType;
use crate::vault::Secret;

#[derive(Clone)]
pub struct OAuthHttpAdapter {
    http: Client,
    kind: DestinationType,
    token_url: Url,
    publish_url: Url,
    client_id: String,
    client_secret: Secret,
}

impl fmt::Debug for OAuthHttpAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthHttpAdapter")
            .field("kind", &self.kind)
            .field("token_url", &self.token_url)
            .field("publish_url", &self.publish_url)
            .finish_non_exhaustive()
    }
}

impl OAuthHttpAdapter {
    pub fn new(
        kind: DestinationType,
        token_url: Url,
        publish_url: Url,
        client_id: String,
        client_secret: Secret,
    ) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("postpilot/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            kind,
            token_url,
            publish_url,
            client_id,
            client_secret,
        })
    }

    pub fn from_config(dest: &config::Destination) -> anyhow::Result<Self> {
        let token_url = Url::parse(&dest.token_url)
            .with_context(|| format!("invalid token_url for {}", dest.kind))?;
        let publish_url = Url::parse(&dest.publish_url)
            .with_context(|| format!("invalid publish_url for {}", dest.kind))?;
        Self::new(
            dest.kind,
            token_url,
            publish_url,
            dest.client_id.clone(),
            Secret::new(dest.client_secret.clone()),
        )
    }

    pub fn build_refresh_request(&self, refresh_token: &Secret) -> Result<reqwest::Request, AdapterError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.expose()),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose()),
        ];
        Ok(self.http.post(self.token_url.clone()).form(&form).build()?)
    }

    pub fn build_publish_request(
        &self,
        access_token: &Secret,
        request: PublishRequest<'_>,
    ) -> Result<reqwest::Request, AdapterError> {
        let body = PublishBody {
            text: request.content,
            media: request
                .media
                .iter()
                .map(|m| MediaBody {
                    url: &m.location,
                    mime_type: m.mime_type.as_deref(),
                    alt_text: m.alt_text.as_deref(),
                })
                .collect(),
        };
        let mut builder = self
            .http
            .post(self.publish_url.clone())
            .bearer_auth(access_token.expose())
            .json(&body);
        if let Some(key) = request.options.idempotency_key.as_deref() {
            builder = builder.header("Idempotency-Key", key);
        }
        Ok(builder.build()?)
    }
}

#[async_trait]
impl DestinationAdapter for OAuthHttpAdapter {
    fn destination(&self) -> DestinationType {
        self.kind
    }

    async fn exchange_refresh_token(&self, refresh_token: &Secret) -> Result<TokenGrant, AdapterError> {
        let request = self.build_refresh_request(refresh_token)?;
        debug!(url = %request.url(), destination = %self.kind, "refreshing token");
        let res = self.http.execute(request).await?;

        let status = res.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            warn!(destination = %self.kind, "rate limited on token refresh");
            return Err(AdapterError::RateLimited(body));
        }
        // invalid_grant / unauthorized_client; other 4xx may be transient.
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            let body = res.text().await.unwrap_or_default();
            warn!(destination = %self.kind, %status, "token refresh rejected");
            return Err(AdapterError::RefreshRejected(format!("{}: {}", status, body)));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(AdapterError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let payload: TokenResponse = res
            .json()
            .await
            .map_err(|err| AdapterError::InvalidResponse(err.to_string()))?;
        if payload.access_token.is_empty() {
            return Err(AdapterError::InvalidResponse("empty access_token".into()));
        }
        Ok(TokenGrant {
            access_token: Secret::new(payload.access_token),
            refresh_token: payload.refresh_token.filter(|t| !t.is_empty()).map(Secret::new),
            expires_in: payload.expires_in,
        })
    }

    async fn publish_with_token(
        &self,
        access_token: &Secret,
        request: PublishRequest<'_>,
    ) -> Result<PublishedPost, AdapterError> {
        let request = self.build_publish_request(access_token, request)?;
        debug!(url = %request.url(), destination = %self.kind, "publishing");
        let res = self.http.execute(request).await?;

        let status = res.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            warn!(destination = %self.kind, "rate limited on publish");
            return Err(AdapterError::RateLimited(body));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(destination = %self.kind, %status, %body, "publish failed");
            return Err(AdapterError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let payload: PublishResponse = res
            .json()
            .await
            .map_err(|err| AdapterError::InvalidResponse(err.to_string()))?;
        let external_id = match payload.id {
            serde_json::Value::String(s) => s,
            serde_json::Value::Number(n) => n.to_string(),
            other => {
                return Err(AdapterError::InvalidResponse(format!(
                    "unexpected id {}",
                    other
                )))
            }
        };
        let url = payload
            .url
            .filter(|u| !u.is_empty())
            .ok_or_else(|| AdapterError::InvalidResponse("missing url".into()))?;

        info!(destination = %self.kind, %external_id, "published");
        Ok(PublishedPost { external_id, url })
    }
}
