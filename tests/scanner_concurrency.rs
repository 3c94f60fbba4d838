use chrono::{Duration, Utc};
use std::collections::HashSet;

use postpilot::db::{self, Pool};
use postpilot::model::{JobState, PostStatus};
use postpilot::queue::JobQueue;
use postpilot::scanner::Scanner;
use postpilot::schedule;

async fn file_pool(dir: &tempfile::TempDir) -> Pool {
    let url = format!("sqlite://{}", dir.path().join("scan.db").display());
    let pool = db::init_pool(&url).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

async fn due_post(pool: &Pool, owner_id: i64) -> i64 {
    let post = db::create_post(pool, owner_id, "due").await.unwrap();
    let now = Utc::now();
    schedule::schedule(pool, owner_id, post, now - Duration::seconds(30), now - Duration::hours(1))
        .await
        .unwrap();
    post
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_scanners_claim_each_post_once() {
    let dir = tempfile::tempdir().unwrap();
    let pool = file_pool(&dir).await;
    let mut posts = Vec::new();
    for owner in 0..20 {
        posts.push(due_post(&pool, owner).await);
    }

    let queue = JobQueue::new(pool.clone(), 100);
    let handles: Vec<_> = (0..6)
        .map(|_| {
            let scanner = Scanner::new(pool.clone(), queue.clone());
            tokio::spawn(async move { scanner.scan_and_claim(50).await.unwrap() })
        })
        .collect();

    let mut claimed = 0;
    for handle in handles {
        claimed += handle.await.unwrap();
    }
    assert_eq!(claimed, posts.len());

    let jobs = db::list_jobs(&pool).await.unwrap();
    assert_eq!(jobs.len(), posts.len());
    let job_posts: HashSet<i64> = jobs.iter().map(|j| j.job.post_id).collect();
    assert_eq!(job_posts, posts.iter().copied().collect::<HashSet<i64>>());
    assert_eq!(
        db::count_jobs(&pool, JobState::Queued).await.unwrap(),
        posts.len() as i64
    );

    for post in posts {
        let stored = db::fetch_post(&pool, post).await.unwrap().unwrap();
        assert_eq!(stored.status, PostStatus::Publishing);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_scanners_one_item_total_one_claim() {
    let dir = tempfile::tempdir().unwrap();
    let pool = file_pool(&dir).await;
    let post = due_post(&pool, 1).await;

    let queue = JobQueue::new(pool.clone(), 100);
    let a = Scanner::new(pool.clone(), queue.clone());
    let b = Scanner::new(pool.clone(), queue.clone());
    let (ra, rb) = tokio::join!(
        tokio::spawn(async move { a.scan_and_claim(10).await.unwrap() }),
        tokio::spawn(async move { b.scan_and_claim(10).await.unwrap() }),
    );
    assert_eq!(ra.unwrap() + rb.unwrap(), 1);

    let jobs = db::list_jobs(&pool).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job.post_id, post);
}

#[tokio::test]
async fn future_posts_are_not_claimed() {
    let dir = tempfile::tempdir().unwrap();
    let pool = file_pool(&dir).await;
    let post = db::create_post(&pool, 1, "later").await.unwrap();
    let now = Utc::now();
    schedule::schedule(&pool, 1, post, now + Duration::minutes(10), now)
        .await
        .unwrap();

    let scanner = Scanner::new(pool.clone(), JobQueue::new(pool.clone(), 100));
    assert_eq!(scanner.scan_and_claim(10).await.unwrap(), 0);
    assert!(db::list_jobs(&pool).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_enqueue_skips_only_that_post() {
    let dir = tempfile::tempdir().unwrap();
    let pool = file_pool(&dir).await;
    let a = due_post(&pool, 1).await;
    let b = due_post(&pool, 2).await;
    sqlx::query(&format!(
        "CREATE TRIGGER reject_one BEFORE INSERT ON jobs WHEN NEW.post_id = {} \
         BEGIN SELECT RAISE(ABORT, 'jobs insert failed'); END",
        a
    ))
    .execute(&pool)
    .await
    .unwrap();

    let scanner = Scanner::new(pool.clone(), JobQueue::new(pool.clone(), 100));
    assert_eq!(scanner.scan_and_claim(10).await.unwrap(), 1);

    let stored_a = db::fetch_post(&pool, a).await.unwrap().unwrap();
    assert_eq!(stored_a.status, PostStatus::Scheduled);
    let stored_b = db::fetch_post(&pool, b).await.unwrap().unwrap();
    assert_eq!(stored_b.status, PostStatus::Publishing);
    let jobs = db::list_jobs(&pool).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job.post_id, b);

    // Once the jobs table accepts it again, the next scan picks the post up.
    sqlx::query("DROP TRIGGER reject_one")
        .execute(&pool)
        .await
        .unwrap();
    assert_eq!(scanner.scan_and_claim(10).await.unwrap(), 1);
    let stored_a = db::fetch_post(&pool, a).await.unwrap().unwrap();
    assert_eq!(stored_a.status, PostStatus::Publishing);
    let jobs = db::list_jobs(&pool).await.unwrap();
    assert_eq!(jobs.iter().filter(|j| j.job.post_id == a).count(), 1);
}
