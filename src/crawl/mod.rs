//! Crawl worker pool and the scheduler tick loop.
//!
//! N workers share one queue through the store's atomic claim. A claimed job
//! runs in its own task so a panic is contained: the supervising worker logs
//! it and simply does not renew the lease, returning the job to the pool.

pub mod cron;
pub mod ingest;
mod scheduler;

pub use ingest::CrawlSummary;
pub use scheduler::run_scheduler;

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::CrawlConfig;
use crate::error::Result;
use crate::fetch::Fetcher;
use crate::model::{CrawlJob, Timestamp};
use crate::store::Store;

/// Pause between claim attempts when the queue is empty.
const IDLE_POLL: Duration = Duration::from_secs(1);

/// Computes the delay before retry number `retries + 1`:
/// `min(ceiling, base * 2^retries)`, jittered by a uniform factor in
/// `[0.5, 1.5]`.
pub fn backoff_delay(base: Duration, ceiling: Duration, retries: u32, jitter: f64) -> Duration {
    let exp = base.saturating_mul(1u32.checked_shl(retries).unwrap_or(u32::MAX));
    let capped = exp.min(ceiling);
    capped.mul_f64(jitter.clamp(0.5, 1.5))
}

fn next_retry_at(config: &CrawlConfig, retries: u32) -> Timestamp {
    let jitter = rand::thread_rng().gen_range(0.5..=1.5);
    OffsetDateTime::now_utc() + backoff_delay(config.retry_base, config.retry_ceiling, retries, jitter)
}

/// Spawns the worker pool. Each worker exits once `shutdown` flips to true;
/// a worker interrupted mid-job returns the job to the queue first.
pub fn spawn_workers<F: Fetcher>(
    store: Store,
    fetcher: Arc<F>,
    config: CrawlConfig,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..config.workers.max(1))
        .map(|index| {
            let store = store.clone();
            let fetcher = fetcher.clone();
            let config = config.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(worker_loop(index, store, fetcher, config, shutdown))
        })
        .collect()
}

async fn worker_loop<F: Fetcher>(
    index: usize,
    store: Store,
    fetcher: Arc<F>,
    config: CrawlConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(worker = index, "crawl worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let visibility = config.visibility_timeout;
        let claimed = {
            let store = store.clone();
            store.run(move |s| s.claim_next_job(visibility)).await
        };
        let job = match claimed {
            Ok(Some(job)) => job,
            Ok(None) => {
                tokio::select! {
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }
            Err(err) => {
                error!(worker = index, error = %err, "claim failed");
                tokio::time::sleep(IDLE_POLL).await;
                continue;
            }
        };

        tokio::select! {
            _ = run_claimed_job(&store, fetcher.clone(), &config, &job) => {}
            _ = shutdown.changed() => {
                // Hand the job back before exiting; the lease is not renewed.
                let job_id = job.id;
                let store = store.clone();
                let _ = store
                    .run(move |s| s.update_job_status(job_id, crate::model::CrawlStatus::Queued))
                    .await;
                warn!(worker = index, job = job.id, "shutdown mid-job, returned to queue");
                break;
            }
        }
    }
    info!(worker = index, "crawl worker stopped");
}

async fn run_claimed_job<F: Fetcher>(
    store: &Store,
    fetcher: Arc<F>,
    config: &CrawlConfig,
    job: &CrawlJob,
) {
    let subreddit = {
        let store = store.clone();
        let subreddit_id = job.subreddit_id;
        store.run(move |s| s.subreddit_by_id(subreddit_id)).await
    };
    let name = match subreddit {
        Ok(Some(subreddit)) => subreddit.name,
        Ok(None) => {
            error!(job = job.id, subreddit = job.subreddit_id, "job target missing");
            let store = store.clone();
            let job_id = job.id;
            let _ = store.run(move |s| s.mark_job_failed(job_id, None)).await;
            return;
        }
        Err(err) => {
            error!(job = job.id, error = %err, "target lookup failed");
            return;
        }
    };

    let started = Instant::now();
    // The job body runs in its own task so a panic is contained here rather
    // than taking the worker down.
    let task = {
        let store = store.clone();
        let name = name.clone();
        let job_id = job.id;
        tokio::spawn(async move { ingest::crawl_subreddit(&store, &*fetcher, job_id, &name).await })
    };
    let outcome = match task.await {
        Ok(result) => result,
        Err(join_err) => {
            error!(job = job.id, subreddit = %name, error = %join_err, "job task panicked");
            // Lease lapses; another worker will reclaim the job.
            return;
        }
    };
    let duration_ms = started.elapsed().as_millis() as i64;

    match outcome {
        Ok(summary) => {
            info!(
                job = job.id,
                subreddit = %name,
                posts = summary.posts,
                comments = summary.comments,
                users = summary.users,
                subreddits_discovered = summary.subreddits_discovered,
                duration_ms,
                "crawl finished"
            );
            let store = store.clone();
            let job_id = job.id;
            if let Err(err) = store
                .run(move |s| s.mark_job_success(job_id, duration_ms))
                .await
            {
                error!(job = job.id, error = %err, "failed to record success");
            }
        }
        Err(err) => {
            let retries = job.retries as u32;
            let retry_at = if err.is_transient() && i64::from(retries) < job.max_retries {
                Some(next_retry_at(config, retries))
            } else {
                None
            };
            warn!(
                job = job.id,
                subreddit = %name,
                error = %err,
                retries,
                retrying = retry_at.is_some(),
                "crawl failed"
            );
            let store = store.clone();
            let job_id = job.id;
            if let Err(err) = store.run(move |s| s.mark_job_failed(job_id, retry_at)).await {
                error!(job = job.id, error = %err, "failed to record failure");
            }
        }
    }
}

/// Enqueues a crawl for a subreddit by name, creating the subreddit row on
/// first sight. Shared by the scheduler, the admin API, and the CLI.
pub async fn enqueue_by_name(
    store: &Store,
    name: &str,
    priority: i64,
    max_retries: i64,
    enqueued_by: &str,
) -> Result<i64> {
    let store = store.clone();
    let name = name.to_string();
    let enqueued_by = enqueued_by.to_string();
    store
        .run(move |s| {
            let subreddit_id = match s.subreddit_by_name(&name)? {
                Some(subreddit) => subreddit.id,
                None => s.upsert_subreddit(&name, None, None, 0, None)?,
            };
            s.enqueue_job(subreddit_id, priority, max_retries, Some(&enqueued_by))
        })
        .await
}
