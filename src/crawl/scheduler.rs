//! Scheduler tick loop for recurring crawls.
//!
//! Once a second, enabled `scheduled_jobs` whose `next_run_at` is due are
//! enqueued and advanced along their cron expression. A due job whose
//! target still has a non-terminal crawl queued is skipped for this
//! occurrence (the enqueue conflict is the idempotence signal, not an
//! error).

use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::model::ScheduledJob;
use crate::store::Store;

use super::cron::Schedule;

const TICK: Duration = Duration::from_secs(1);

/// Runs until `shutdown` flips. Jobs with an unset `next_run_at` are
/// initialized on the first tick.
pub async fn run_scheduler(store: Store, mut shutdown: watch::Receiver<bool>) {
    info!("scheduler started");
    if let Err(err) = initialize_next_runs(&store).await {
        warn!(error = %err, "scheduler bootstrap failed");
    }
    loop {
        tokio::select! {
            _ = tokio::time::sleep(TICK) => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
        if let Err(err) = tick(&store).await {
            warn!(error = %err, "scheduler tick failed");
        }
    }
    info!("scheduler stopped");
}

async fn initialize_next_runs(store: &Store) -> crate::error::Result<()> {
    let jobs = {
        let store = store.clone();
        store.run(move |s| s.list_scheduled_jobs()).await?
    };
    let now = OffsetDateTime::now_utc();
    for job in jobs {
        if !job.enabled || job.next_run_at.is_some() {
            continue;
        }
        let next = match Schedule::parse(&job.cron_expression) {
            Ok(schedule) => schedule.next_after(now),
            Err(err) => {
                warn!(job = %job.name, error = %err, "unparseable cron expression");
                continue;
            }
        };
        let store = store.clone();
        let id = job.id;
        let last = job.last_run_at;
        store
            .run(move |s| s.mark_scheduled_run(id, last.unwrap_or(now), next))
            .await?;
    }
    Ok(())
}

async fn tick(store: &Store) -> crate::error::Result<()> {
    let now = OffsetDateTime::now_utc();
    let due = {
        let store = store.clone();
        store.run(move |s| s.due_scheduled_jobs(now)).await?
    };
    for job in due {
        fire(store, &job, now).await?;
    }
    Ok(())
}

async fn fire(store: &Store, job: &ScheduledJob, now: OffsetDateTime) -> crate::error::Result<()> {
    if let Some(subreddit_id) = job.subreddit_id {
        let enqueued = {
            let store = store.clone();
            let priority = job.priority;
            store
                .run(move |s| s.enqueue_job(subreddit_id, priority, 3, Some("scheduler")))
                .await
        };
        match enqueued {
            Ok(job_id) => {
                debug!(schedule = %job.name, job = job_id, "scheduled crawl enqueued");
            }
            Err(Error::Conflict(_)) => {
                debug!(schedule = %job.name, "target already queued, skipping occurrence");
            }
            Err(err) => return Err(err),
        }
    }
    let next = match Schedule::parse(&job.cron_expression) {
        Ok(schedule) => schedule.next_after(now),
        Err(err) => {
            warn!(schedule = %job.name, error = %err, "unparseable cron expression, disabling");
            let store = store.clone();
            let id = job.id;
            store.run(move |s| s.set_scheduled_enabled(id, false)).await?;
            None
        }
    };
    let store = store.clone();
    let id = job.id;
    store
        .run(move |s| s.mark_scheduled_run(id, now, next))
        .await
}
