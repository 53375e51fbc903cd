//! Scheduled (recurring) crawl definitions.

use rusqlite::{params, OptionalExtension, Row};

use crate::error::{Error, Result};
use crate::model::{ScheduledJob, Timestamp};

use super::Store;

fn scheduled_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduledJob> {
    Ok(ScheduledJob {
        id: row.get(0)?,
        name: row.get(1)?,
        subreddit_id: row.get(2)?,
        cron_expression: row.get(3)?,
        enabled: row.get(4)?,
        last_run_at: row.get(5)?,
        next_run_at: row.get(6)?,
        priority: row.get(7)?,
    })
}

const SCHEDULED_COLUMNS: &str =
    "id, name, subreddit_id, cron_expression, enabled, last_run_at, next_run_at, priority";

impl Store {
    /// Creates or replaces a recurring job definition by unique name.
    pub fn upsert_scheduled_job(
        &self,
        name: &str,
        subreddit_id: Option<i64>,
        cron_expression: &str,
        priority: i64,
        next_run_at: Option<Timestamp>,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            let id = conn.query_row(
                "INSERT INTO scheduled_jobs (name, subreddit_id, cron_expression, priority, next_run_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (name) DO UPDATE SET
                     subreddit_id = excluded.subreddit_id,
                     cron_expression = excluded.cron_expression,
                     priority = excluded.priority,
                     next_run_at = excluded.next_run_at
                 RETURNING id",
                params![name, subreddit_id, cron_expression, priority, next_run_at],
                |row| row.get(0),
            )?;
            Ok(id)
        })
    }

    /// Enabled jobs whose `next_run_at` is due at `now`, oldest due first.
    pub fn due_scheduled_jobs(&self, now: Timestamp) -> Result<Vec<ScheduledJob>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SCHEDULED_COLUMNS} FROM scheduled_jobs
                 WHERE enabled AND next_run_at IS NOT NULL AND next_run_at <= ?1
                 ORDER BY next_run_at ASC, id ASC"
            ))?;
            let rows = stmt.query_map(params![now], scheduled_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Stamps a fired job and advances its next occurrence.
    pub fn mark_scheduled_run(
        &self,
        id: i64,
        last_run_at: Timestamp,
        next_run_at: Option<Timestamp>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE scheduled_jobs SET last_run_at = ?1, next_run_at = ?2 WHERE id = ?3",
                params![last_run_at, next_run_at, id],
            )?;
            Ok(())
        })
    }

    /// All recurring definitions, by name.
    pub fn list_scheduled_jobs(&self) -> Result<Vec<ScheduledJob>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SCHEDULED_COLUMNS} FROM scheduled_jobs ORDER BY name ASC"
            ))?;
            let rows = stmt.query_map([], scheduled_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Fetches one recurring definition by name.
    pub fn scheduled_job_by_name(&self, name: &str) -> Result<Option<ScheduledJob>> {
        self.with_conn(|conn| {
            let job = conn
                .query_row(
                    &format!("SELECT {SCHEDULED_COLUMNS} FROM scheduled_jobs WHERE name = ?1"),
                    [name],
                    scheduled_from_row,
                )
                .optional()?;
            Ok(job)
        })
    }

    /// Enables or disables a recurring definition.
    pub fn set_scheduled_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE scheduled_jobs SET enabled = ?1 WHERE id = ?2",
                params![enabled, id],
            )?;
            if changed == 0 {
                return Err(Error::NotFound("scheduled job"));
            }
            Ok(())
        })
    }
}
