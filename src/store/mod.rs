//! Durable relational backing for crawled entities, the job queue, the
//! materialized graph, the community hierarchy, and the version log.
//!
//! The store is SQLite behind a bounded connection pool. Synchronous callers
//! (workers, the precalc engine) use the typed operations directly; async
//! callers go through [`Store::run`], which moves the closure onto the
//! blocking thread pool.

mod communities;
mod derive;
mod entities;
mod graph;
mod jobs;
mod pool;
mod scheduled;
mod schema;
mod versions;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rusqlite::Connection;
use tokio::task;

use crate::error::Result;
use pool::Pool;

pub use entities::{NewComment, NewPost};
pub use graph::{GraphSlice, NodeSelection, PageCursor, PositionWrite};
pub use jobs::QueueCounts;
pub use versions::{DiffRow, VersionDiffs};

/// Handle to the primary datastore. Cheap to clone; all clones share one
/// pool and one feature-detection state.
#[derive(Clone)]
pub struct Store {
    pool: Pool,
    has_positions: Arc<AtomicBool>,
}

impl Store {
    /// Opens (creating if missing) the database at `path` with a pool of
    /// `pool_size` connections. Call [`Store::migrate`] before first use.
    pub fn open(path: &Path, pool_size: usize) -> Result<Self> {
        let pool = Pool::open(path, pool_size)?;
        Ok(Self {
            pool,
            has_positions: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Applies all pending migrations, then re-detects optional features.
    pub fn migrate(&self) -> Result<()> {
        let mut conn = self.pool.checkout();
        schema::migrate(&mut conn, schema::LATEST_VERSION)?;
        drop(conn);
        self.detect_features()
    }

    /// Applies migrations up to `version` only. Used by tests to exercise
    /// feature gating on older schemas.
    pub fn migrate_to(&self, version: i64) -> Result<()> {
        let mut conn = self.pool.checkout();
        schema::migrate(&mut conn, version)?;
        drop(conn);
        self.detect_features()
    }

    /// Probes the live schema for optional capabilities (position columns).
    pub fn detect_features(&self) -> Result<()> {
        let conn = self.pool.checkout();
        let has = schema::has_position_columns(&conn)?;
        self.has_positions.store(has, Ordering::Release);
        Ok(())
    }

    /// Whether `graph_nodes` carries `pos_x/pos_y/pos_z`. Layout is skipped
    /// when this is false.
    pub fn has_position_columns(&self) -> bool {
        self.has_positions.load(Ordering::Acquire)
    }

    /// Pool capacity and idle count, for health reporting.
    pub fn pool_usage(&self) -> (usize, usize) {
        (self.pool.capacity(), self.pool.available())
    }

    /// Runs a synchronous store operation on the blocking thread pool.
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Store) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        task::spawn_blocking(move || f(&store)).await?
    }

    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.pool.checkout();
        f(&conn)
    }

    pub(crate) fn with_conn_mut<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.pool.checkout();
        f(&mut conn)
    }
}
