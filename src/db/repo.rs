use super::model::{ClaimOutcome, CredentialRecord, DuePost, LinkForPublish, MediaAttachment, PostForPublish};
use crate::model::{DestinationType, JobState, LinkStatus, Post, PostStatus, PublishJob, QueuedJob};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use tracing::instrument;

pub type Pool = SqlitePool;

const JOB_COLUMNS: &str = "id, idempotency_key, post_id, owner_id, state, worker_id, error, \
                           enqueued_at, started_at, finished_at";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {}", normalized))?
        .create_if_missing(true)
        // WAL plus full fsync for durable claims and job state.
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") {
        return url.to_string();
    }

    // In-memory URLs like sqlite::memory: or sqlite::memory:?cache=shared
    if url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn parse_post_status(raw: &str) -> Result<PostStatus> {
    PostStatus::parse_state(raw).ok_or_else(|| anyhow!("unknown post status {}", raw))
}

fn parse_destination(raw: &str) -> Result<DestinationType> {
    DestinationType::parse(raw).ok_or_else(|| anyhow!("unknown destination type {}", raw))
}

/// Insert a DRAFT post. Authoring lives outside this crate; this is its write path.
#[instrument(skip_all)]
pub async fn create_post(pool: &Pool, owner_id: i64, content: &str) -> Result<i64> {
    let rec = sqlx::query("INSERT INTO posts (owner_id, content, status) VALUES (?, ?, ?) RETURNING id")
        .bind(owner_id)
        .bind(content)
        .bind(PostStatus::Draft.as_str())
        .fetch_one(pool)
        .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn fetch_post(pool: &Pool, post_id: i64) -> Result<Option<Post>> {
    let row = sqlx::query(
        "SELECT id, owner_id, content, status, scheduled_at, published_at FROM posts WHERE id = ?",
    )
    .bind(post_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let status: String = row.get("status");
    Ok(Some(Post {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        content: row.get("content"),
        status: parse_post_status(&status)?,
        scheduled_at: row.try_get::<Option<DateTime<Utc>>, _>("scheduled_at")?,
        published_at: row.try_get::<Option<DateTime<Utc>>, _>("published_at")?,
    }))
}

pub async fn fetch_post_for_publish(pool: &Pool, post_id: i64) -> Result<Option<PostForPublish>> {
    let row = sqlx::query("SELECT id, owner_id, content, status FROM posts WHERE id = ?")
        .bind(post_id)
        .fetch_optional(pool)
        .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let status: String = row.get("status");
    Ok(Some(PostForPublish {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        content: row.get("content"),
        status: parse_post_status(&status)
            .with_context(|| format!("post {} has unreadable status", post_id))?,
    }))
}

/// Move a DRAFT or SCHEDULED post to SCHEDULED at `at`. Returns false when the
/// post was in any other state by the time the update ran.
#[instrument(skip_all)]
pub async fn schedule_post(pool: &Pool, post_id: i64, at: DateTime<Utc>, now: DateTime<Utc>) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE posts SET status = ?, scheduled_at = ?, updated_at = ? \
         WHERE id = ? AND status IN ('DRAFT', 'SCHEDULED')",
    )
    .bind(PostStatus::Scheduled.as_str())
    .bind(at)
    .bind(now)
    .bind(post_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn unschedule_post(pool: &Pool, post_id: i64, now: DateTime<Utc>) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE posts SET status = ?, scheduled_at = NULL, updated_at = ? \
         WHERE id = ? AND status = 'SCHEDULED'",
    )
    .bind(PostStatus::Draft.as_str())
    .bind(now)
    .bind(post_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// SCHEDULED posts whose time has come, oldest first.
#[instrument(skip_all)]
pub async fn list_due_posts(pool: &Pool, now: DateTime<Utc>, limit: u32) -> Result<Vec<DuePost>> {
    let rows = sqlx::query(
        "SELECT id, owner_id FROM posts \
         WHERE status = 'SCHEDULED' AND scheduled_at IS NOT NULL \
           AND julianday(scheduled_at) <= julianday(?) \
         ORDER BY julianday(scheduled_at) ASC, id ASC LIMIT ?",
    )
    .bind(now)
    .bind(i64::from(limit))
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| DuePost {
            id: row.get("id"),
            owner_id: row.get("owner_id"),
        })
        .collect())
}

/// Claim a due post (compare-and-set SCHEDULED -> PUBLISHING) and enqueue its
/// publish job in one transaction. Exactly one concurrent caller claims a
/// given post; a failed enqueue rolls the claim back.
#[instrument(skip_all)]
pub async fn claim_and_enqueue(pool: &Pool, job: PublishJob, now: DateTime<Utc>) -> Result<ClaimOutcome> {
    let mut tx = pool.begin().await?;
    let res = sqlx::query(
        "UPDATE posts SET status = ?, updated_at = ? WHERE id = ? AND status = 'SCHEDULED'",
    )
    .bind(PostStatus::Publishing.as_str())
    .bind(now)
    .bind(job.post_id)
    .execute(&mut *tx)
    .await?;
    if res.rows_affected() != 1 {
        return Ok(ClaimOutcome::Lost);
    }

    let outcome = match insert_job_tx(&mut tx, job, now).await? {
        Some(id) => ClaimOutcome::Enqueued(id),
        None => ClaimOutcome::Deduplicated,
    };
    tx.commit().await?;
    Ok(outcome)
}

/// Move DRAFT or SCHEDULED to PUBLISHING. Returns false when the post already
/// left those states (for example, claimed by the scanner meanwhile).
#[instrument(skip_all)]
pub async fn mark_post_publishing(pool: &Pool, post_id: i64, now: DateTime<Utc>) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE posts SET status = ?, updated_at = ? \
         WHERE id = ? AND status IN ('DRAFT', 'SCHEDULED')",
    )
    .bind(PostStatus::Publishing.as_str())
    .bind(now)
    .bind(post_id)
    .execute(pool)
    .await
    .context("failed to mark post publishing")?;
    Ok(res.rows_affected() == 1)
}

/// Persist the aggregate outcome of a publish attempt.
#[instrument(skip_all)]
pub async fn finish_post(
    pool: &Pool,
    post_id: i64,
    status: PostStatus,
    published_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE posts SET status = ?, published_at = COALESCE(?, published_at), updated_at = ? \
         WHERE id = ?",
    )
    .bind(status.as_str())
    .bind(published_at)
    .bind(now)
    .bind(post_id)
    .execute(pool)
    .await
    .context("failed to persist post outcome")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn link_destination(
    pool: &Pool,
    post_id: i64,
    credential_id: i64,
    custom_content: Option<&str>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO post_platforms (post_id, platform_id, custom_content) VALUES (?, ?, ?) RETURNING id",
    )
    .bind(post_id)
    .bind(credential_id)
    .bind(custom_content)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

pub async fn fetch_links_for_publish(pool: &Pool, post_id: i64) -> Result<Vec<LinkForPublish>> {
    let rows = sqlx::query(
        "SELECT pp.id AS link_id, pp.platform_id, pp.custom_content, \
                p.platform_type, p.is_active \
         FROM post_platforms pp \
         JOIN platforms p ON p.id = pp.platform_id \
         WHERE pp.post_id = ? \
         ORDER BY pp.id ASC",
    )
    .bind(post_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            let kind: String = row.get("platform_type");
            Ok(LinkForPublish {
                link_id: row.get("link_id"),
                credential_id: row.get("platform_id"),
                destination: parse_destination(&kind)?,
                custom_content: row
                    .try_get::<Option<String>, _>("custom_content")?
                    .filter(|s| !s.trim().is_empty()),
                credential_active: row.get::<bool, _>("is_active"),
            })
        })
        .collect()
}

#[instrument(skip_all)]
pub async fn record_link_success(
    pool: &Pool,
    link_id: i64,
    external_id: &str,
    external_url: &str,
    published_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE post_platforms SET status = ?, external_id = ?, external_url = ?, \
                published_at = ?, error_message = NULL \
         WHERE id = ?",
    )
    .bind(LinkStatus::Published.as_str())
    .bind(external_id)
    .bind(external_url)
    .bind(published_at)
    .bind(link_id)
    .execute(pool)
    .await
    .context("failed to persist link success")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn record_link_failure(pool: &Pool, link_id: i64, error_message: &str) -> Result<()> {
    sqlx::query("UPDATE post_platforms SET status = ?, error_message = ? WHERE id = ?")
        .bind(LinkStatus::Failed.as_str())
        .bind(error_message)
        .bind(link_id)
        .execute(pool)
        .await
        .context("failed to persist link failure")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn attach_media(
    pool: &Pool,
    post_id: i64,
    storage_key: &str,
    mime_type: Option<&str>,
    alt_text: Option<&str>,
    position: i64,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO post_media (post_id, storage_key, mime_type, alt_text, position) \
         VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(post_id)
    .bind(storage_key)
    .bind(mime_type)
    .bind(alt_text)
    .bind(position)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

pub async fn list_media_for_post(pool: &Pool, post_id: i64) -> Result<Vec<MediaAttachment>> {
    let rows = sqlx::query(
        "SELECT id, storage_key, mime_type, alt_text, position FROM post_media \
         WHERE post_id = ? ORDER BY position ASC, id ASC",
    )
    .bind(post_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| MediaAttachment {
            id: row.get("id"),
            storage_key: row.get("storage_key"),
            mime_type: row.try_get::<Option<String>, _>("mime_type").ok().flatten(),
            alt_text: row.try_get::<Option<String>, _>("alt_text").ok().flatten(),
            position: row.get("position"),
        })
        .collect())
}

/// Store a credential. Token arguments must already be vault-encrypted.
#[instrument(skip_all)]
pub async fn insert_credential(
    pool: &Pool,
    owner_id: i64,
    destination: DestinationType,
    encrypted_access_token: &str,
    encrypted_refresh_token: Option<&str>,
    token_expires_at: Option<DateTime<Utc>>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO platforms (owner_id, platform_type, access_token, refresh_token, token_expires_at) \
         VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(owner_id)
    .bind(destination.as_str())
    .bind(encrypted_access_token)
    .bind(encrypted_refresh_token)
    .bind(token_expires_at)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

pub async fn fetch_credential(pool: &Pool, credential_id: i64) -> Result<Option<CredentialRecord>> {
    let row = sqlx::query(
        "SELECT id, owner_id, platform_type, access_token, refresh_token, token_expires_at, is_active \
         FROM platforms WHERE id = ?",
    )
    .bind(credential_id)
    .fetch_optional(pool)
    .await?;

    row.map(|row| credential_from_row(&row)).transpose()
}

fn credential_from_row(row: &SqliteRow) -> Result<CredentialRecord> {
    let kind: String = row.get("platform_type");
    Ok(CredentialRecord {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        destination: parse_destination(&kind)?,
        access_token: row.get("access_token"),
        refresh_token: row.try_get::<Option<String>, _>("refresh_token")?,
        token_expires_at: row.try_get::<Option<DateTime<Utc>>, _>("token_expires_at")?,
        is_active: row.get::<bool, _>("is_active"),
    })
}

/// Persist a rotated token pair. A `None` refresh token keeps the stored one.
#[instrument(skip_all)]
pub async fn update_credential_tokens(
    pool: &Pool,
    credential_id: i64,
    encrypted_access_token: &str,
    encrypted_refresh_token: Option<&str>,
    token_expires_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE platforms SET access_token = ?, refresh_token = COALESCE(?, refresh_token), \
                token_expires_at = ?, updated_at = ? \
         WHERE id = ?",
    )
    .bind(encrypted_access_token)
    .bind(encrypted_refresh_token)
    .bind(token_expires_at)
    .bind(now)
    .bind(credential_id)
    .execute(pool)
    .await
    .context("failed to persist rotated credential")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn deactivate_credential(pool: &Pool, credential_id: i64, now: DateTime<Utc>) -> Result<()> {
    sqlx::query("UPDATE platforms SET is_active = 0, updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(credential_id)
        .execute(pool)
        .await
        .context("failed to deactivate credential")?;
    Ok(())
}

fn job_from_row(row: &SqliteRow) -> Result<QueuedJob> {
    let state: String = row.get("state");
    Ok(QueuedJob {
        id: row.get("id"),
        idempotency_key: row.get("idempotency_key"),
        job: PublishJob::new(row.get("post_id"), row.get("owner_id")),
        state: JobState::parse_state(&state).ok_or_else(|| anyhow!("unknown job state {}", state))?,
        worker_id: row.try_get::<Option<String>, _>("worker_id")?,
        error: row.try_get::<Option<String>, _>("error")?,
        enqueued_at: row.try_get("enqueued_at")?,
        started_at: row.try_get::<Option<DateTime<Utc>>, _>("started_at")?,
        finished_at: row.try_get::<Option<DateTime<Utc>>, _>("finished_at")?,
    })
}

/// Insert a queued job unless its idempotency key is already present.
/// Returns the new job id, or `None` when the enqueue was deduplicated.
#[instrument(skip_all)]
pub async fn enqueue_job(pool: &Pool, job: PublishJob, now: DateTime<Utc>) -> Result<Option<i64>> {
    let mut tx = pool.begin().await?;
    let id = insert_job_tx(&mut tx, job, now).await?;
    tx.commit().await?;
    Ok(id)
}

async fn insert_job_tx(
    tx: &mut Transaction<'_, Sqlite>,
    job: PublishJob,
    now: DateTime<Utc>,
) -> Result<Option<i64>> {
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO jobs (idempotency_key, post_id, owner_id, state, enqueued_at) \
         VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(idempotency_key) DO NOTHING RETURNING id",
    )
    .bind(job.idempotency_key())
    .bind(job.post_id)
    .bind(job.owner_id)
    .bind(JobState::Queued.as_str())
    .bind(now)
    .fetch_optional(&mut **tx)
    .await
    .context("failed to enqueue job")?;
    Ok(id)
}

/// Atomically move the oldest queued job to active for `worker_id`.
#[instrument(skip_all)]
pub async fn claim_next_job(pool: &Pool, worker_id: &str, now: DateTime<Utc>) -> Result<Option<QueuedJob>> {
    let sql = format!(
        "UPDATE jobs SET state = 'active', worker_id = ?, started_at = ? \
         WHERE id = (SELECT id FROM jobs WHERE state = 'queued' ORDER BY id ASC LIMIT 1) \
         RETURNING {}",
        JOB_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(worker_id)
        .bind(now)
        .fetch_optional(pool)
        .await?;
    row.map(|row| job_from_row(&row)).transpose()
}

#[instrument(skip_all)]
pub async fn complete_job(pool: &Pool, job_id: i64, now: DateTime<Utc>) -> Result<()> {
    sqlx::query("UPDATE jobs SET state = 'completed', error = NULL, finished_at = ? WHERE id = ?")
        .bind(now)
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn fail_job(pool: &Pool, job_id: i64, error: &str, now: DateTime<Utc>) -> Result<()> {
    sqlx::query("UPDATE jobs SET state = 'failed', error = ?, finished_at = ? WHERE id = ?")
        .bind(error)
        .bind(now)
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Keep only the newest `keep` rows in each finished state.
#[instrument(skip_all)]
pub async fn prune_finished_jobs(pool: &Pool, keep: u32) -> Result<u64> {
    let mut removed = 0;
    for state in [JobState::Completed, JobState::Failed] {
        let res = sqlx::query(
            "DELETE FROM jobs WHERE state = ?1 AND id NOT IN ( \
                 SELECT id FROM jobs WHERE state = ?1 ORDER BY id DESC LIMIT ?2)",
        )
        .bind(state.as_str())
        .bind(i64::from(keep))
        .execute(pool)
        .await?;
        removed += res.rows_affected();
    }
    Ok(removed)
}

/// Put jobs that have been active since before `started_before` back in the queue.
#[instrument(skip_all)]
pub async fn requeue_stalled_jobs(pool: &Pool, started_before: DateTime<Utc>) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE jobs SET state = 'queued', worker_id = NULL, started_at = NULL \
         WHERE state = 'active' AND julianday(started_at) < julianday(?)",
    )
    .bind(started_before)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

pub async fn list_jobs(pool: &Pool) -> Result<Vec<QueuedJob>> {
    let sql = format!("SELECT {} FROM jobs ORDER BY id ASC", JOB_COLUMNS);
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    rows.iter().map(job_from_row).collect()
}

pub async fn count_jobs(pool: &Pool, state: JobState) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE state = ?")
        .bind(state.as_str())
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn setup_pool() -> Pool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[test]
    fn prepare_url_leaves_memory_urls_alone() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");
    }

    #[test]
    fn prepare_url_normalizes_and_keeps_query() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("nested").join("db.sqlite");
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let out = prepare_sqlite_url(&url);
        assert_eq!(out, format!("sqlite://{}?mode=rwc", path.display()));
        assert!(td.path().join("nested").exists());
    }

    #[tokio::test]
    async fn due_query_and_claim() {
        let pool = setup_pool().await;
        let now = Utc::now();

        let due = create_post(&pool, 1, "due").await.unwrap();
        let later = create_post(&pool, 1, "later").await.unwrap();
        let draft = create_post(&pool, 1, "draft").await.unwrap();
        assert!(schedule_post(&pool, due, now - Duration::minutes(1), now - Duration::hours(1))
            .await
            .unwrap());
        assert!(schedule_post(&pool, later, now + Duration::hours(1), now).await.unwrap());

        let found = list_due_posts(&pool, now, 10).await.unwrap();
        assert_eq!(found, vec![DuePost { id: due, owner_id: 1 }]);

        let claimed = claim_and_enqueue(&pool, PublishJob::new(due, 1), now).await.unwrap();
        assert!(matches!(claimed, ClaimOutcome::Enqueued(_)));
        assert_eq!(
            claim_and_enqueue(&pool, PublishJob::new(due, 1), now).await.unwrap(),
            ClaimOutcome::Lost
        );
        assert_eq!(
            claim_and_enqueue(&pool, PublishJob::new(draft, 1), now).await.unwrap(),
            ClaimOutcome::Lost
        );
        assert!(list_due_posts(&pool, now, 10).await.unwrap().is_empty());

        let post = fetch_post(&pool, due).await.unwrap().unwrap();
        assert_eq!(post.status, PostStatus::Publishing);
        assert_eq!(count_jobs(&pool, JobState::Queued).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_enqueue_rolls_back_the_claim() {
        let pool = setup_pool().await;
        let now = Utc::now();
        let post = create_post(&pool, 1, "due").await.unwrap();
        schedule_post(&pool, post, now - Duration::minutes(1), now - Duration::hours(1))
            .await
            .unwrap();
        sqlx::query(
            "CREATE TRIGGER reject_jobs BEFORE INSERT ON jobs \
             BEGIN SELECT RAISE(ABORT, 'jobs table unavailable'); END",
        )
        .execute(&pool)
        .await
        .unwrap();

        assert!(claim_and_enqueue(&pool, PublishJob::new(post, 1), now).await.is_err());
        let stored = fetch_post(&pool, post).await.unwrap().unwrap();
        assert_eq!(stored.status, PostStatus::Scheduled);
        assert_eq!(list_due_posts(&pool, now, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mark_publishing_reports_lost_race() {
        let pool = setup_pool().await;
        let now = Utc::now();
        let post = create_post(&pool, 1, "x").await.unwrap();
        assert!(mark_post_publishing(&pool, post, now).await.unwrap());
        assert!(!mark_post_publishing(&pool, post, now).await.unwrap());
    }

    #[tokio::test]
    async fn enqueue_deduplicates_by_key() {
        let pool = setup_pool().await;
        let now = Utc::now();
        let job = PublishJob::new(5, 1);

        let first = enqueue_job(&pool, job, now).await.unwrap();
        assert!(first.is_some());
        assert!(enqueue_job(&pool, job, now).await.unwrap().is_none());

        let claimed = claim_next_job(&pool, "w1", now).await.unwrap().unwrap();
        assert_eq!(claimed.idempotency_key, "publish-post-5");
        assert_eq!(claimed.state, JobState::Active);
        complete_job(&pool, claimed.id, now).await.unwrap();

        // Still retained in history, so still deduplicated.
        assert!(enqueue_job(&pool, job, now).await.unwrap().is_none());
        assert!(claim_next_job(&pool, "w1", now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn prune_keeps_newest_finished_jobs() {
        let pool = setup_pool().await;
        let now = Utc::now();
        for post_id in 1..=5 {
            let id = enqueue_job(&pool, PublishJob::new(post_id, 1), now)
                .await
                .unwrap()
                .unwrap();
            if post_id % 2 == 0 {
                fail_job(&pool, id, "boom", now).await.unwrap();
            } else {
                complete_job(&pool, id, now).await.unwrap();
            }
        }
        enqueue_job(&pool, PublishJob::new(99, 1), now).await.unwrap();

        let removed = prune_finished_jobs(&pool, 1).await.unwrap();
        assert_eq!(removed, 3);
        assert_eq!(count_jobs(&pool, JobState::Completed).await.unwrap(), 1);
        assert_eq!(count_jobs(&pool, JobState::Failed).await.unwrap(), 1);
        assert_eq!(count_jobs(&pool, JobState::Queued).await.unwrap(), 1);

        // Pruned keys are free again.
        assert!(enqueue_job(&pool, PublishJob::new(1, 1), now).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stalled_jobs_are_requeued() {
        let pool = setup_pool().await;
        let now = Utc::now();
        enqueue_job(&pool, PublishJob::new(1, 1), now).await.unwrap();
        let job = claim_next_job(&pool, "dead-worker", now - Duration::hours(1))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(requeue_stalled_jobs(&pool, now - Duration::hours(2)).await.unwrap(), 0);
        assert_eq!(requeue_stalled_jobs(&pool, now - Duration::minutes(10)).await.unwrap(), 1);

        let again = claim_next_job(&pool, "w2", now).await.unwrap().unwrap();
        assert_eq!(again.id, job.id);
        assert_eq!(again.worker_id.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn credential_rotation_keeps_refresh_token_when_absent() {
        let pool = setup_pool().await;
        let now = Utc::now();
        let id = insert_credential(&pool, 1, DestinationType::Mastodon, "enc-a", Some("enc-r"), None)
            .await
            .unwrap();

        update_credential_tokens(&pool, id, "enc-a2", None, Some(now), now)
            .await
            .unwrap();
        let cred = fetch_credential(&pool, id).await.unwrap().unwrap();
        assert_eq!(cred.access_token, "enc-a2");
        assert_eq!(cred.refresh_token.as_deref(), Some("enc-r"));
        assert!(cred.is_active);

        deactivate_credential(&pool, id, now).await.unwrap();
        let cred = fetch_credential(&pool, id).await.unwrap().unwrap();
        assert!(!cred.is_active);
    }

    #[tokio::test]
    async fn media_is_returned_in_position_order() {
        let pool = setup_pool().await;
        let post = create_post(&pool, 1, "with media").await.unwrap();
        attach_media(&pool, post, "b.png", Some("image/png"), None, 2).await.unwrap();
        attach_media(&pool, post, "a.jpg", None, Some("alt"), 1).await.unwrap();

        let media = list_media_for_post(&pool, post).await.unwrap();
        let keys: Vec<&str> = media.iter().map(|m| m.storage_key.as_str()).collect();
        assert_eq!(keys, vec!["a.jpg", "b.png"]);
        assert_eq!(media[0].alt_text.as_deref(), Some("alt"));
    }
}
