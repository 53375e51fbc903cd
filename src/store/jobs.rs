//! Crawl job queue operations.
//!
//! The queue lives in `crawl_jobs`. Claiming is a single atomic UPDATE so
//! two workers can never hold the same job; SQLite's writer serialization
//! stands in for `SELECT … FOR UPDATE SKIP LOCKED`. A claimed job holds a
//! visibility lease (`visible_at`); if the lease lapses the job is returned
//! to the claimable pool before the next claim.

use std::time::Duration;

use rusqlite::{params, OptionalExtension, Row};
use time::OffsetDateTime;

use crate::error::{Error, Result};
use crate::model::{CrawlJob, CrawlStatus, Timestamp};

use super::Store;

/// Queue depth by status, for health and stats reporting.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct QueueCounts {
    pub queued: i64,
    pub crawling: i64,
    pub success: i64,
    pub failed: i64,
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<CrawlJob> {
    let status: String = row.get(2)?;
    Ok(CrawlJob {
        id: row.get(0)?,
        subreddit_id: row.get(1)?,
        status: CrawlStatus::parse(&status).unwrap_or(CrawlStatus::Failed),
        priority: row.get(3)?,
        retries: row.get(4)?,
        max_retries: row.get(5)?,
        visible_at: row.get(6)?,
        next_retry_at: row.get(7)?,
        last_attempt: row.get(8)?,
        duration_ms: row.get(9)?,
        enqueued_by: row.get(10)?,
    })
}

const JOB_COLUMNS: &str = "id, subreddit_id, status, priority, retries, max_retries,
    visible_at, next_retry_at, last_attempt, duration_ms, enqueued_by";

impl Store {
    /// Enqueues a crawl of `subreddit_id`.
    ///
    /// Idempotent over the target: while a non-terminal job exists for the
    /// same subreddit the call fails with [`Error::Conflict`] carrying the
    /// existing job id.
    pub fn enqueue_job(
        &self,
        subreddit_id: i64,
        priority: i64,
        max_retries: i64,
        enqueued_by: Option<&str>,
    ) -> Result<i64> {
        let now = OffsetDateTime::now_utc();
        self.with_conn(|conn| {
            let inserted = conn.query_row(
                "INSERT INTO crawl_jobs (subreddit_id, status, priority, max_retries,
                                         enqueued_by, created_at, updated_at)
                 VALUES (?1, 'queued', ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT (subreddit_id) WHERE status IN ('queued', 'crawling')
                 DO NOTHING
                 RETURNING id",
                params![subreddit_id, priority, max_retries, enqueued_by, now],
                |row| row.get::<_, i64>(0),
            );
            match inserted {
                Ok(id) => Ok(id),
                Err(rusqlite::Error::QueryReturnedNoRows) => {
                    let existing: i64 = conn.query_row(
                        "SELECT id FROM crawl_jobs
                         WHERE subreddit_id = ?1 AND status IN ('queued', 'crawling')",
                        [subreddit_id],
                        |row| row.get(0),
                    )?;
                    Err(Error::Conflict(format!(
                        "job {existing} already queued for subreddit {subreddit_id}"
                    )))
                }
                Err(err) => Err(err.into()),
            }
        })
    }

    /// Atomically claims the next runnable job, marking it `crawling` and
    /// granting a visibility lease of `visibility`.
    ///
    /// Expired `crawling` leases are returned to `queued` first, so a worker
    /// that died mid-job does not strand its target.
    pub fn claim_next_job(&self, visibility: Duration) -> Result<Option<CrawlJob>> {
        let now = OffsetDateTime::now_utc();
        let lease = now + visibility;
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE crawl_jobs SET status = 'queued', updated_at = ?1
                 WHERE status = 'crawling' AND visible_at IS NOT NULL AND visible_at <= ?1",
                params![now],
            )?;
            let claimed = tx
                .query_row(
                    &format!(
                        "UPDATE crawl_jobs
                         SET status = 'crawling', visible_at = ?1, last_attempt = ?2, updated_at = ?2
                         WHERE id = (
                             SELECT id FROM crawl_jobs
                             WHERE status = 'queued' AND (visible_at IS NULL OR visible_at <= ?2)
                             ORDER BY priority DESC, id ASC
                             LIMIT 1
                         )
                         RETURNING {JOB_COLUMNS}"
                    ),
                    params![lease, now],
                    job_from_row,
                )
                .optional()?;
            tx.commit()?;
            Ok(claimed)
        })
    }

    /// Extends a claimed job's visibility lease by `dt` from now.
    pub fn extend_lease(&self, job_id: i64, dt: Duration) -> Result<()> {
        let now = OffsetDateTime::now_utc();
        let lease = now + dt;
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE crawl_jobs SET visible_at = ?1, updated_at = ?2
                 WHERE id = ?3 AND status = 'crawling'",
                params![lease, now, job_id],
            )?;
            Ok(())
        })
    }

    /// Marks a job successful and records its run duration.
    pub fn mark_job_success(&self, job_id: i64, duration_ms: i64) -> Result<()> {
        let now = OffsetDateTime::now_utc();
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE crawl_jobs
                 SET status = 'success', duration_ms = ?1, visible_at = NULL, updated_at = ?2
                 WHERE id = ?3",
                params![duration_ms, now, job_id],
            )?;
            Ok(())
        })
    }

    /// Re-queues a failed attempt with the caller-computed retry time, or
    /// leaves the job terminally failed when retries are exhausted.
    pub fn mark_job_failed(&self, job_id: i64, next_retry_at: Option<Timestamp>) -> Result<()> {
        let now = OffsetDateTime::now_utc();
        self.with_conn(|conn| {
            match next_retry_at {
                Some(at) => conn.execute(
                    "UPDATE crawl_jobs
                     SET status = 'queued', retries = retries + 1,
                         next_retry_at = ?1, visible_at = ?1, updated_at = ?2
                     WHERE id = ?3",
                    params![at, now, job_id],
                )?,
                None => conn.execute(
                    "UPDATE crawl_jobs
                     SET status = 'failed', retries = retries + 1,
                         next_retry_at = NULL, visible_at = NULL, updated_at = ?1
                     WHERE id = ?2",
                    params![now, job_id],
                )?,
            };
            Ok(())
        })
    }

    /// Fetches one job.
    pub fn job(&self, job_id: i64) -> Result<Option<CrawlJob>> {
        self.with_conn(|conn| {
            let job = conn
                .query_row(
                    &format!("SELECT {JOB_COLUMNS} FROM crawl_jobs WHERE id = ?1"),
                    [job_id],
                    job_from_row,
                )
                .optional()?;
            Ok(job)
        })
    }

    /// Lists jobs, optionally filtered by status, newest first.
    pub fn list_jobs(&self, status: Option<CrawlStatus>, limit: usize) -> Result<Vec<CrawlJob>> {
        self.with_conn(|conn| {
            let mut out = Vec::new();
            match status {
                Some(status) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {JOB_COLUMNS} FROM crawl_jobs
                         WHERE status = ?1 ORDER BY id DESC LIMIT ?2"
                    ))?;
                    let rows = stmt.query_map(params![status.as_str(), limit as i64], job_from_row)?;
                    for row in rows {
                        out.push(row?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {JOB_COLUMNS} FROM crawl_jobs ORDER BY id DESC LIMIT ?1"
                    ))?;
                    let rows = stmt.query_map(params![limit as i64], job_from_row)?;
                    for row in rows {
                        out.push(row?);
                    }
                }
            }
            Ok(out)
        })
    }

    /// Admin override of a job's status.
    pub fn update_job_status(&self, job_id: i64, status: CrawlStatus) -> Result<()> {
        let now = OffsetDateTime::now_utc();
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE crawl_jobs SET status = ?1, visible_at = NULL, updated_at = ?2
                 WHERE id = ?3",
                params![status.as_str(), now, job_id],
            )?;
            if changed == 0 {
                return Err(Error::NotFound("crawl job"));
            }
            Ok(())
        })
    }

    /// Admin override of a job's priority.
    pub fn update_job_priority(&self, job_id: i64, priority: i64) -> Result<()> {
        let now = OffsetDateTime::now_utc();
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE crawl_jobs SET priority = ?1, updated_at = ?2 WHERE id = ?3",
                params![priority, now, job_id],
            )?;
            if changed == 0 {
                return Err(Error::NotFound("crawl job"));
            }
            Ok(())
        })
    }

    /// Returns a failed job to the queue with a reset retry budget.
    pub fn retry_job(&self, job_id: i64) -> Result<()> {
        let now = OffsetDateTime::now_utc();
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE crawl_jobs
                 SET status = 'queued', retries = 0, next_retry_at = NULL,
                     visible_at = NULL, updated_at = ?1
                 WHERE id = ?2 AND status = 'failed'",
                params![now, job_id],
            )?;
            if changed == 0 {
                return Err(Error::NotFound("failed crawl job"));
            }
            Ok(())
        })
    }

    /// Re-queues every terminally failed job. Returns how many moved.
    pub fn bulk_retry_failed(&self) -> Result<usize> {
        let now = OffsetDateTime::now_utc();
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE crawl_jobs
                 SET status = 'queued', retries = 0, next_retry_at = NULL,
                     visible_at = NULL, updated_at = ?1
                 WHERE status = 'failed'",
                params![now],
            )?;
            Ok(changed)
        })
    }

    /// Queue depth grouped by status.
    pub fn queue_counts(&self) -> Result<QueueCounts> {
        self.with_conn(|conn| {
            let mut counts = QueueCounts::default();
            let mut stmt =
                conn.prepare("SELECT status, COUNT(*) FROM crawl_jobs GROUP BY status")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let status: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                match CrawlStatus::parse(&status) {
                    Some(CrawlStatus::Queued) => counts.queued = count,
                    Some(CrawlStatus::Crawling) => counts.crawling = count,
                    Some(CrawlStatus::Success) => counts.success = count,
                    Some(CrawlStatus::Failed) | None => counts.failed += count,
                }
            }
            Ok(counts)
        })
    }
}
