//! Database entity and view models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use crate::model::{DestinationType, PostStatus};
use chrono::{DateTime, Utc};
use std::fmt;

/// Post slice loaded by the orchestrator at the start of a publish attempt.
#[derive(Debug, Clone)]
pub struct PostForPublish {
    pub id: i64,
    pub owner_id: i64,
    pub content: String,
    pub status: PostStatus,
}

/// One post/destination link joined with the credential it publishes through.
#[derive(Debug, Clone)]
pub struct LinkForPublish {
    pub link_id: i64,
    pub credential_id: i64,
    pub destination: DestinationType,
    pub custom_content: Option<String>,
    pub credential_active: bool,
}

/// Ordered media attachment of a post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaAttachment {
    pub id: i64,
    pub storage_key: String,
    pub mime_type: Option<String>,
    pub alt_text: Option<String>,
    pub position: i64,
}

/// Stored destination credential. Token fields are vault ciphertext.
#[derive(Clone)]
pub struct CredentialRecord {
    pub id: i64,
    pub owner_id: i64,
    pub destination: DestinationType,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("id", &self.id)
            .field("owner_id", &self.owner_id)
            .field("destination", &self.destination)
            .field("token_expires_at", &self.token_expires_at)
            .field("is_active", &self.is_active)
            .finish_non_exhaustive()
    }
}

/// Candidate returned by the due-item query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuePost {
    pub id: i64,
    pub owner_id: i64,
}

/// Result of trying to claim one due post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Another caller claimed it first, or it is no longer scheduled.
    Lost,
    Enqueued(i64),
    /// Claimed, but a job with the same key was still present.
    Deduplicated,
}
