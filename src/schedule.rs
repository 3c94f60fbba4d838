//! Scheduling transitions: DRAFT -> SCHEDULED and back.
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, instrument};

use crate::db::{self, Pool};
use crate::model::{Post, PostStatus};

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("scheduled time {0} is not in the future")]
    InPast(DateTime<Utc>),
    #[error("post {0} not found")]
    NotFound(i64),
    #[error("post {post_id} does not belong to owner {owner_id}")]
    WrongOwner { post_id: i64, owner_id: i64 },
    #[error("post {post_id} cannot change schedule from status {status}")]
    InvalidState { post_id: i64, status: PostStatus },
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

async fn load_owned(pool: &Pool, owner_id: i64, post_id: i64) -> Result<Post, ScheduleError> {
    let post = db::fetch_post(pool, post_id)
        .await?
        .ok_or(ScheduleError::NotFound(post_id))?;
    if post.owner_id != owner_id {
        return Err(ScheduleError::WrongOwner { post_id, owner_id });
    }
    Ok(post)
}

/// Schedule (or reschedule) a post for `at`, which must be after `now`.
#[instrument(skip(pool))]
pub async fn schedule(
    pool: &Pool,
    owner_id: i64,
    post_id: i64,
    at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<(), ScheduleError> {
    if at <= now {
        return Err(ScheduleError::InPast(at));
    }
    let post = load_owned(pool, owner_id, post_id).await?;
    if !post.status.can_transition_to(PostStatus::Scheduled) {
        return Err(ScheduleError::InvalidState {
            post_id,
            status: post.status,
        });
    }
    if !db::schedule_post(pool, post_id, at, now).await? {
        // Claimed or otherwise moved on between the read and the update.
        let status = db::fetch_post(pool, post_id)
            .await?
            .map(|p| p.status)
            .unwrap_or(post.status);
        return Err(ScheduleError::InvalidState { post_id, status });
    }
    info!(post_id, %at, "post scheduled");
    Ok(())
}

#[instrument(skip(pool))]
pub async fn unschedule(
    pool: &Pool,
    owner_id: i64,
    post_id: i64,
    now: DateTime<Utc>,
) -> Result<(), ScheduleError> {
    let post = load_owned(pool, owner_id, post_id).await?;
    if post.status != PostStatus::Scheduled || !db::unschedule_post(pool, post_id, now).await? {
        return Err(ScheduleError::InvalidState {
            post_id,
            status: post.status,
        });
    }
    info!(post_id, "post unscheduled");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PublishJob;
    use chrono::Duration;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_pool() -> Pool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn past_time_is_rejected_without_mutation() {
        let pool = setup_pool().await;
        let now = Utc::now();
        let post = db::create_post(&pool, 1, "hello").await.unwrap();

        let err = schedule(&pool, 1, post, now - Duration::minutes(1), now)
            .await
            .unwrap_err();
        assert!(matches!(err, ScheduleError::InPast(_)));
        let err = schedule(&pool, 1, post, now, now).await.unwrap_err();
        assert!(matches!(err, ScheduleError::InPast(_)));

        let stored = db::fetch_post(&pool, post).await.unwrap().unwrap();
        assert_eq!(stored.status, PostStatus::Draft);
        assert!(stored.scheduled_at.is_none());
    }

    #[tokio::test]
    async fn future_time_moves_draft_to_scheduled() {
        let pool = setup_pool().await;
        let now = Utc::now();
        let at = now + Duration::hours(2);
        let post = db::create_post(&pool, 1, "hello").await.unwrap();

        schedule(&pool, 1, post, at, now).await.unwrap();
        let stored = db::fetch_post(&pool, post).await.unwrap().unwrap();
        assert_eq!(stored.status, PostStatus::Scheduled);
        assert_eq!(stored.scheduled_at.map(|t| t.timestamp()), Some(at.timestamp()));

        // Rescheduling moves the time.
        let later = now + Duration::hours(5);
        schedule(&pool, 1, post, later, now).await.unwrap();
        let stored = db::fetch_post(&pool, post).await.unwrap().unwrap();
        assert_eq!(stored.scheduled_at.map(|t| t.timestamp()), Some(later.timestamp()));
    }

    #[tokio::test]
    async fn ownership_and_state_are_checked() {
        let pool = setup_pool().await;
        let now = Utc::now();
        let post = db::create_post(&pool, 1, "hello").await.unwrap();

        let err = schedule(&pool, 2, post, now + Duration::hours(1), now)
            .await
            .unwrap_err();
        assert!(matches!(err, ScheduleError::WrongOwner { .. }));
        assert!(matches!(
            schedule(&pool, 1, 999, now + Duration::hours(1), now).await,
            Err(ScheduleError::NotFound(999))
        ));

        schedule(&pool, 1, post, now + Duration::hours(1), now).await.unwrap();
        let claim = db::claim_and_enqueue(&pool, PublishJob::new(post, 1), now)
            .await
            .unwrap();
        assert!(matches!(claim, db::ClaimOutcome::Enqueued(_)));
        let err = schedule(&pool, 1, post, now + Duration::hours(1), now)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ScheduleError::InvalidState {
                status: PostStatus::Publishing,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn unschedule_returns_to_draft() {
        let pool = setup_pool().await;
        let now = Utc::now();
        let post = db::create_post(&pool, 1, "hello").await.unwrap();

        assert!(matches!(
            unschedule(&pool, 1, post, now).await,
            Err(ScheduleError::InvalidState { .. })
        ));

        schedule(&pool, 1, post, now + Duration::hours(1), now).await.unwrap();
        unschedule(&pool, 1, post, now).await.unwrap();
        let stored = db::fetch_post(&pool, post).await.unwrap().unwrap();
        assert_eq!(stored.status, PostStatus::Draft);
        assert!(stored.scheduled_at.is_none());
    }
}
