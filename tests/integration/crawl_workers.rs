#![allow(missing_docs)]

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clustermap::config::{CrawlConfig, LayoutConfig};
use clustermap::crawl::{self, backoff_delay};
use clustermap::error::{Error, Result};
use clustermap::fetch::{
    CommentInfo, Fetcher, Listing, PostInfo, PostTree, SubredditInfo, UserActivity,
};
use clustermap::model::{CrawlStatus, DiffAction, EntityType};
use clustermap::precalc::{PrecalcOptions, Precalculator};
use clustermap::store::Store;
use proptest::prelude::*;
use tempfile::{tempdir, TempDir};
use tokio::sync::watch;

#[derive(Clone, Copy, PartialEq)]
enum FakeMode {
    Healthy,
    Transient,
    Gone,
}

#[derive(Clone)]
struct FakeFetcher {
    mode: FakeMode,
    calls: Arc<AtomicU32>,
}

impl FakeFetcher {
    fn new(mode: FakeMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            calls: Arc::new(AtomicU32::new(0)),
        })
    }

    fn check(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        match self.mode {
            FakeMode::Healthy => Ok(()),
            FakeMode::Transient => Err(Error::Upstream("fake upstream outage".into())),
            FakeMode::Gone => Err(Error::NotFound("upstream resource")),
        }
    }
}

impl Fetcher for FakeFetcher {
    fn listing(
        &self,
        subreddit: String,
        _after: Option<String>,
    ) -> impl Future<Output = Result<Listing>> + Send {
        let check = self.check();
        async move {
            check?;
            Ok(Listing {
                subreddit: SubredditInfo {
                    name: subreddit,
                    title: Some("Fake".to_string()),
                    description: None,
                    subscribers: 1_234,
                    created_at: None,
                },
                posts: vec![
                    PostInfo {
                        id: "t3_one".to_string(),
                        title: "first".to_string(),
                        author: Some("alice".to_string()),
                        selftext: None,
                        permalink: None,
                        score: 10,
                        flair: None,
                        url: None,
                        is_self: true,
                        created_at: None,
                        num_comments: 1,
                    },
                    PostInfo {
                        id: "t3_two".to_string(),
                        title: "second".to_string(),
                        author: Some("bob".to_string()),
                        selftext: None,
                        permalink: None,
                        score: 4,
                        flair: None,
                        url: None,
                        is_self: false,
                        created_at: None,
                        num_comments: 0,
                    },
                ],
                after: None,
            })
        }
    }

    fn post_tree(&self, post_id: String) -> impl Future<Output = Result<PostTree>> + Send {
        let check = self.check();
        async move {
            check?;
            Ok(PostTree {
                post_id,
                comments: vec![CommentInfo {
                    id: "t1_c1".to_string(),
                    parent_id: None,
                    author: Some("bob".to_string()),
                    body: Some("hello".to_string()),
                    score: 2,
                    depth: 0,
                    created_at: None,
                }],
            })
        }
    }

    fn user_activity(&self, username: String) -> impl Future<Output = Result<UserActivity>> + Send {
        let check = self.check();
        async move {
            check?;
            Ok(UserActivity {
                username,
                created_at: None,
                subreddits: vec!["rust".to_string(), "golang".to_string()],
            })
        }
    }
}

fn setup_store() -> (TempDir, Store) {
    let dir = tempdir().expect("tempdir");
    let store = Store::open(&dir.path().join("crawl.db"), 4).expect("open");
    store.migrate().expect("migrate");
    (dir, store)
}

fn fast_config() -> CrawlConfig {
    CrawlConfig {
        workers: 1,
        rate_per_sec: 1_000.0,
        burst: 100,
        max_retries: 2,
        retry_base: Duration::from_millis(10),
        retry_ceiling: Duration::from_millis(50),
        visibility_timeout: Duration::from_secs(30),
    }
}

async fn wait_for_status(store: &Store, job_id: i64, status: CrawlStatus) -> clustermap::model::CrawlJob {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let job = {
            let store = store.clone();
            store
                .run(move |s| s.job(job_id))
                .await
                .expect("job lookup")
                .expect("job exists")
        };
        if job.status == status {
            return job;
        }
        if Instant::now() > deadline {
            panic!(
                "job {job_id} never reached {:?}, currently {:?} after {} retries",
                status, job.status, job.retries
            );
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_crawls_a_job_to_success() {
    let (_dir, store) = setup_store();
    let fetcher = FakeFetcher::new(FakeMode::Healthy);
    let job_id = crawl::enqueue_by_name(&store, "rust", 0, 2, "test")
        .await
        .expect("enqueue");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = crawl::spawn_workers(store.clone(), fetcher, fast_config(), shutdown_rx);

    let job = wait_for_status(&store, job_id, CrawlStatus::Success).await;
    assert!(job.duration_ms.is_some());
    assert!(job.last_attempt.is_some());

    // Entities landed, including the stub for the discovered subreddit.
    let (subreddits, users, posts, comments) = {
        let store = store.clone();
        store.run(|s| s.entity_counts()).await.expect("counts")
    };
    assert_eq!(subreddits, 2, "crawled target plus the discovered stub");
    assert_eq!(posts, 2);
    assert_eq!(comments, 1);
    assert_eq!(users, 2);
    let golang = {
        let store = store.clone();
        store
            .run(|s| s.subreddit_by_name("golang"))
            .await
            .expect("lookup")
            .expect("discovered stub")
    };
    assert_eq!(golang.subscribers, 0, "stub rows carry no counts yet");

    // Workers never write the graph projection; that is precalc's job.
    let node_count = {
        let store = store.clone();
        store.run(|s| s.node_count()).await.expect("count")
    };
    assert_eq!(node_count, 0, "graph rows appear only after a precalc pass");

    // One precalc pass projects the crawl and records it in the diff log.
    let engine = Precalculator::new(
        store.clone(),
        LayoutConfig {
            max_nodes: 100,
            iterations: 20,
            batch_size: 10,
            epsilon: 0.0,
            auto_tune: false,
        },
    );
    let outcome = engine
        .run(PrecalcOptions {
            full_rebuild: true,
            ..PrecalcOptions::default()
        })
        .await
        .expect("precalc");
    assert!(outcome.diff_rows > 0, "crawl-discovered rows must be diffed");

    let nodes = {
        let store = store.clone();
        store.run(|s| s.all_nodes()).await.expect("nodes")
    };
    let ids: Vec<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
    assert!(ids.contains(&"sub:rust"));
    assert!(ids.contains(&"user:alice"));
    assert!(ids.contains(&"t3_one"));
    assert!(ids.contains(&"t1_c1"));
    assert!(ids.contains(&"sub:golang"));

    let links = {
        let store = store.clone();
        store.run(|s| s.all_links()).await.expect("links")
    };
    assert!(links
        .iter()
        .any(|l| l.source == "t3_one" && l.target == "sub:rust"));
    assert!(links
        .iter()
        .any(|l| l.source == "t1_c1" && l.target == "t3_one"));
    assert!(links
        .iter()
        .any(|l| l.source == "user:alice" && l.target == "sub:rust"));

    // Every projected node shows up as an Add diff under the new version.
    let batches = {
        let store = store.clone();
        store.run(|s| s.diffs_since(0)).await.expect("diffs")
    };
    assert_eq!(batches.len(), 1);
    let added: Vec<&str> = batches[0]
        .diffs
        .iter()
        .filter(|d| d.action == DiffAction::Add && d.entity_type == EntityType::Node)
        .map(|d| d.entity_id.as_str())
        .collect();
    for id in ["sub:rust", "sub:golang", "user:alice", "t3_one", "t1_c1"] {
        assert!(added.contains(&id), "missing add diff for {id}");
    }

    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transient_failures_retry_then_exhaust() {
    let (_dir, store) = setup_store();
    let fetcher = FakeFetcher::new(FakeMode::Transient);
    let job_id = crawl::enqueue_by_name(&store, "flaky", 0, 2, "test")
        .await
        .expect("enqueue");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = crawl::spawn_workers(store.clone(), fetcher, fast_config(), shutdown_rx);

    let job = wait_for_status(&store, job_id, CrawlStatus::Failed).await;
    // Two retries granted, the third failure is terminal.
    assert_eq!(job.retries, 3);
    assert!(job.next_retry_at.is_none());

    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hard_upstream_errors_fail_terminally() {
    let (_dir, store) = setup_store();
    let fetcher = FakeFetcher::new(FakeMode::Gone);
    let job_id = crawl::enqueue_by_name(&store, "deleted_sub", 0, 2, "test")
        .await
        .expect("enqueue");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = crawl::spawn_workers(store.clone(), fetcher.clone(), fast_config(), shutdown_rx);

    let job = wait_for_status(&store, job_id, CrawlStatus::Failed).await;
    // No retry budget spent on a 404-class failure beyond the first attempt.
    assert_eq!(job.retries, 1);
    assert_eq!(fetcher.calls.load(Ordering::Relaxed), 1);

    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scheduler_enqueues_due_jobs_and_advances() {
    let (_dir, store) = setup_store();
    let sub = {
        let store = store.clone();
        store
            .run(|s| s.upsert_subreddit("scheduled", None, None, 0, None))
            .await
            .expect("sub")
    };
    {
        let store = store.clone();
        let now = time::OffsetDateTime::now_utc();
        store
            .run(move |s| s.upsert_scheduled_job("refresh", Some(sub), "@every 1h", 1, Some(now)))
            .await
            .expect("schedule");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = tokio::spawn(crawl::run_scheduler(store.clone(), shutdown_rx));

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let counts = {
            let store = store.clone();
            store.run(|s| s.queue_counts()).await.expect("counts")
        };
        if counts.queued == 1 {
            break;
        }
        assert!(Instant::now() < deadline, "scheduler never fired");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let job = {
        let store = store.clone();
        store
            .run(|s| s.scheduled_job_by_name("refresh"))
            .await
            .expect("lookup")
            .expect("definition")
    };
    assert!(job.last_run_at.is_some());
    let next = job.next_run_at.expect("advanced");
    assert!(next > time::OffsetDateTime::now_utc() + Duration::from_secs(3_000));

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), scheduler).await;
}

proptest! {
    #[test]
    fn backoff_grows_monotonically_and_caps(
        base_ms in 1u64..2_000,
        ceiling_ms in 2_000u64..120_000,
        retries in 0u32..20,
    ) {
        let base = Duration::from_millis(base_ms);
        let ceiling = Duration::from_millis(ceiling_ms);
        let current = backoff_delay(base, ceiling, retries, 1.0);
        let next = backoff_delay(base, ceiling, retries + 1, 1.0);
        prop_assert!(next >= current, "raw backoff must not shrink");
        prop_assert!(current <= ceiling);
    }

    #[test]
    fn backoff_jitter_stays_in_band(
        base_ms in 1u64..2_000,
        retries in 0u32..10,
        jitter in 0.5f64..=1.5,
    ) {
        let base = Duration::from_millis(base_ms);
        let ceiling = Duration::from_secs(60);
        let raw = backoff_delay(base, ceiling, retries, 1.0);
        let jittered = backoff_delay(base, ceiling, retries, jitter);
        prop_assert!(jittered >= raw.mul_f64(0.5) - Duration::from_millis(1));
        prop_assert!(jittered <= raw.mul_f64(1.5) + Duration::from_millis(1));
    }
}
