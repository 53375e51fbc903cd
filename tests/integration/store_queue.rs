#![allow(missing_docs)]

use std::time::Duration;

use clustermap::model::CrawlStatus;
use clustermap::store::Store;
use clustermap::Error;
use tempfile::{tempdir, TempDir};
use time::OffsetDateTime;

fn setup_store() -> (TempDir, Store) {
    let dir = tempdir().expect("tempdir");
    let store = Store::open(&dir.path().join("queue.db"), 2).expect("open");
    store.migrate().expect("migrate");
    (dir, store)
}

fn seed_subreddit(store: &Store, name: &str) -> i64 {
    store
        .upsert_subreddit(name, None, None, 0, None)
        .expect("subreddit")
}

#[test]
fn enqueue_is_idempotent_per_target() {
    let (_dir, store) = setup_store();
    let sub = seed_subreddit(&store, "rust");

    let first = store.enqueue_job(sub, 0, 3, Some("test")).expect("enqueue");
    let second = store.enqueue_job(sub, 0, 3, Some("test"));
    match second {
        Err(Error::Conflict(message)) => {
            assert!(message.contains(&first.to_string()));
        }
        other => panic!("expected conflict, got {other:?}"),
    }

    // A terminal job frees the slot.
    store.mark_job_success(first, 12).expect("success");
    let third = store.enqueue_job(sub, 0, 3, Some("test")).expect("re-enqueue");
    assert_ne!(first, third);
}

#[test]
fn claim_orders_by_priority_then_id() {
    let (_dir, store) = setup_store();
    let low = seed_subreddit(&store, "low");
    let high = seed_subreddit(&store, "high");
    let mid_a = seed_subreddit(&store, "mid_a");
    let mid_b = seed_subreddit(&store, "mid_b");

    store.enqueue_job(low, 0, 3, None).expect("enqueue");
    let mid_a_job = store.enqueue_job(mid_a, 5, 3, None).expect("enqueue");
    let mid_b_job = store.enqueue_job(mid_b, 5, 3, None).expect("enqueue");
    store.enqueue_job(high, 9, 3, None).expect("enqueue");

    let visibility = Duration::from_secs(60);
    let first = store.claim_next_job(visibility).expect("claim").expect("job");
    assert_eq!(first.subreddit_id, high);
    assert_eq!(first.status, CrawlStatus::Crawling);

    // Equal priority breaks ties by id ascending.
    let second = store.claim_next_job(visibility).expect("claim").expect("job");
    assert_eq!(second.id, mid_a_job.min(mid_b_job));
    let third = store.claim_next_job(visibility).expect("claim").expect("job");
    assert_eq!(third.id, mid_a_job.max(mid_b_job));

    let fourth = store.claim_next_job(visibility).expect("claim").expect("job");
    assert_eq!(fourth.subreddit_id, low);
    assert!(store.claim_next_job(visibility).expect("claim").is_none());
}

#[test]
fn expired_lease_returns_job_to_pool() {
    let (_dir, store) = setup_store();
    let sub = seed_subreddit(&store, "leaky");
    store.enqueue_job(sub, 0, 3, None).expect("enqueue");

    let claimed = store
        .claim_next_job(Duration::from_millis(20))
        .expect("claim")
        .expect("job");

    // While the lease holds, nobody else can claim it.
    assert!(store
        .claim_next_job(Duration::from_secs(60))
        .expect("claim")
        .is_none());

    std::thread::sleep(Duration::from_millis(40));
    let reclaimed = store
        .claim_next_job(Duration::from_secs(60))
        .expect("claim")
        .expect("job");
    assert_eq!(reclaimed.id, claimed.id);
}

#[test]
fn lease_extension_keeps_job_hidden() {
    let (_dir, store) = setup_store();
    let sub = seed_subreddit(&store, "busy");
    store.enqueue_job(sub, 0, 3, None).expect("enqueue");

    let job = store
        .claim_next_job(Duration::from_millis(30))
        .expect("claim")
        .expect("job");
    store
        .extend_lease(job.id, Duration::from_secs(60))
        .expect("extend");
    std::thread::sleep(Duration::from_millis(60));
    assert!(store
        .claim_next_job(Duration::from_secs(60))
        .expect("claim")
        .is_none());
}

#[test]
fn failed_retry_hides_until_retry_time() {
    let (_dir, store) = setup_store();
    let sub = seed_subreddit(&store, "flaky");
    store.enqueue_job(sub, 0, 3, None).expect("enqueue");
    let job = store
        .claim_next_job(Duration::from_secs(60))
        .expect("claim")
        .expect("job");

    let retry_at = OffsetDateTime::now_utc() + Duration::from_millis(50);
    store
        .mark_job_failed(job.id, Some(retry_at))
        .expect("fail with retry");

    let stored = store.job(job.id).expect("get").expect("job");
    assert_eq!(stored.status, CrawlStatus::Queued);
    assert_eq!(stored.retries, 1);
    assert!(stored.next_retry_at.is_some());

    // Hidden while the backoff holds, claimable after.
    assert!(store
        .claim_next_job(Duration::from_secs(60))
        .expect("claim")
        .is_none());
    std::thread::sleep(Duration::from_millis(80));
    let reclaimed = store
        .claim_next_job(Duration::from_secs(60))
        .expect("claim")
        .expect("job");
    assert_eq!(reclaimed.id, job.id);
}

#[test]
fn terminal_failure_and_bulk_retry() {
    let (_dir, store) = setup_store();
    let sub_a = seed_subreddit(&store, "dead_a");
    let sub_b = seed_subreddit(&store, "dead_b");
    let job_a = store.enqueue_job(sub_a, 0, 3, None).expect("enqueue");
    let job_b = store.enqueue_job(sub_b, 0, 3, None).expect("enqueue");

    store.mark_job_failed(job_a, None).expect("fail");
    store.mark_job_failed(job_b, None).expect("fail");
    let counts = store.queue_counts().expect("counts");
    assert_eq!(counts.failed, 2);

    assert_eq!(store.bulk_retry_failed().expect("bulk"), 2);
    let counts = store.queue_counts().expect("counts");
    assert_eq!(counts.queued, 2);
    assert_eq!(counts.failed, 0);

    // Retried jobs have a reset budget.
    let job = store.job(job_a).expect("get").expect("job");
    assert_eq!(job.retries, 0);
}

#[test]
fn retry_rejects_non_failed_jobs() {
    let (_dir, store) = setup_store();
    let sub = seed_subreddit(&store, "queuedonly");
    let job = store.enqueue_job(sub, 0, 3, None).expect("enqueue");
    assert!(matches!(store.retry_job(job), Err(Error::NotFound(_))));
}

#[test]
fn scheduled_jobs_become_due_and_advance() {
    let (_dir, store) = setup_store();
    let sub = seed_subreddit(&store, "daily");
    let now = OffsetDateTime::now_utc();

    store
        .upsert_scheduled_job("daily-refresh", Some(sub), "@every 1h", 2, Some(now))
        .expect("upsert");
    let due = store.due_scheduled_jobs(now).expect("due");
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].name, "daily-refresh");

    let next = now + Duration::from_secs(3_600);
    store
        .mark_scheduled_run(due[0].id, now, Some(next))
        .expect("mark run");
    assert!(store.due_scheduled_jobs(now).expect("due").is_empty());
    assert_eq!(
        store
            .due_scheduled_jobs(next)
            .expect("due")
            .len(),
        1
    );

    store
        .set_scheduled_enabled(due[0].id, false)
        .expect("disable");
    assert!(store.due_scheduled_jobs(next).expect("due").is_empty());
}

#[test]
fn updated_at_trigger_fires_on_entity_update() {
    let (_dir, store) = setup_store();
    let id = seed_subreddit(&store, "trigger_check");
    let before = store
        .subreddit_by_id(id)
        .expect("get")
        .expect("subreddit")
        .updated_at;
    std::thread::sleep(Duration::from_millis(10));
    store
        .upsert_subreddit("trigger_check", Some("new title"), None, 42, None)
        .expect("update");
    let after = store
        .subreddit_by_id(id)
        .expect("get")
        .expect("subreddit");
    assert_eq!(after.subscribers, 42);
    assert!(after.updated_at > before, "updated_at must advance on write");
}
