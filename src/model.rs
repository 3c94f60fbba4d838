use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Aggregate status of a post.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PostStatus {
    Draft,
    Scheduled,
    Publishing,
    Published,
    PartiallyPublished,
    Failed,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Draft => "DRAFT",
            PostStatus::Scheduled => "SCHEDULED",
            PostStatus::Publishing => "PUBLISHING",
            PostStatus::Published => "PUBLISHED",
            PostStatus::PartiallyPublished => "PARTIALLY_PUBLISHED",
            PostStatus::Failed => "FAILED",
        }
    }

    pub fn parse_state(value: &str) -> Option<Self> {
        match value {
            "DRAFT" => Some(PostStatus::Draft),
            "SCHEDULED" => Some(PostStatus::Scheduled),
            "PUBLISHING" => Some(PostStatus::Publishing),
            "PUBLISHED" => Some(PostStatus::Published),
            "PARTIALLY_PUBLISHED" => Some(PostStatus::PartiallyPublished),
            "FAILED" => Some(PostStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for PostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome recorded on a single post/destination link.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkStatus {
    Published,
    Failed,
}

impl LinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::Published => "PUBLISHED",
            LinkStatus::Failed => "FAILED",
        }
    }

    pub fn parse_state(value: &str) -> Option<Self> {
        match value {
            "PUBLISHED" => Some(LinkStatus::Published),
            "FAILED" => Some(LinkStatus::Failed),
            _ => None,
        }
    }
}

/// External service a post can be published to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DestinationType {
    Twitter,
    Linkedin,
    Facebook,
    Instagram,
    Mastodon,
    Bluesky,
}

impl DestinationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DestinationType::Twitter => "twitter",
            DestinationType::Linkedin => "linkedin",
            DestinationType::Facebook => "facebook",
            DestinationType::Instagram => "instagram",
            DestinationType::Mastodon => "mastodon",
            DestinationType::Bluesky => "bluesky",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "twitter" => Some(DestinationType::Twitter),
            "linkedin" => Some(DestinationType::Linkedin),
            "facebook" => Some(DestinationType::Facebook),
            "instagram" => Some(DestinationType::Instagram),
            "mastodon" => Some(DestinationType::Mastodon),
            "bluesky" => Some(DestinationType::Bluesky),
            _ => None,
        }
    }
}

impl fmt::Display for DestinationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn parse_state(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(JobState::Queued),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: i64,
    pub owner_id: i64,
    pub content: String,
    pub status: PostStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
}

/// Payload carried by the job queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishJob {
    pub post_id: i64,
    pub owner_id: i64,
}

impl PublishJob {
    pub fn new(post_id: i64, owner_id: i64) -> Self {
        Self { post_id, owner_id }
    }

    /// Deterministic key used to deduplicate enqueues for the same post.
    pub fn idempotency_key(&self) -> String {
        format!("publish-post-{}", self.post_id)
    }
}

/// Queue-resident job row as seen by workers and the inspect tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: i64,
    pub idempotency_key: String,
    pub job: PublishJob,
    pub state: JobState,
    pub worker_id: Option<String>,
    pub error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Per-destination outcome returned by a publish call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DestinationResult {
    pub link_id: i64,
    pub credential_id: i64,
    pub destination: DestinationType,
    pub success: bool,
    pub external_url: Option<String>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_status_round_trips_through_storage_form() {
        for status in [
            PostStatus::Draft,
            PostStatus::Scheduled,
            PostStatus::Publishing,
            PostStatus::Published,
            PostStatus::PartiallyPublished,
            PostStatus::Failed,
        ] {
            assert_eq!(PostStatus::parse_state(status.as_str()), Some(status));
        }
        assert_eq!(PostStatus::parse_state("bogus"), None);
    }

    #[test]
    fn idempotency_key_is_derived_from_post_id() {
        assert_eq!(PublishJob::new(42, 7).idempotency_key(), "publish-post-42");
        assert_eq!(
            PublishJob::new(42, 1).idempotency_key(),
            PublishJob::new(42, 9).idempotency_key()
        );
    }

    #[test]
    fn destination_type_serializes_lowercase() {
        let json = serde_json::to_string(&DestinationType::Linkedin).unwrap();
        assert_eq!(json, "\"linkedin\"");
        assert_eq!(DestinationType::parse("mastodon"), Some(DestinationType::Mastodon));
    }
}
