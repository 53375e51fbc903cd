//! Bounded SQLite connection pool.
//!
//! All components share one pool; a checkout blocks until a connection is
//! free, so the pool size is the hard bound on concurrent store work.

use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rusqlite::Connection;

use crate::error::Result;

struct PoolInner {
    idle: Mutex<Vec<Connection>>,
    available: Condvar,
    capacity: usize,
}

/// A fixed-size pool of connections to one database file.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Opens `capacity` connections against `path`, applying the shared
    /// pragmas to each.
    pub fn open(path: &Path, capacity: usize) -> Result<Self> {
        let capacity = capacity.max(1);
        let mut idle = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            idle.push(open_connection(path)?);
        }
        Ok(Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(idle),
                available: Condvar::new(),
                capacity,
            }),
        })
    }

    /// Checks out a connection, blocking until one is idle.
    pub fn checkout(&self) -> PooledConnection {
        let mut idle = self.inner.idle.lock();
        loop {
            if let Some(conn) = idle.pop() {
                return PooledConnection {
                    pool: self.inner.clone(),
                    conn: Some(conn),
                };
            }
            self.inner.available.wait(&mut idle);
        }
    }

    /// Total connections managed by the pool.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Connections currently idle (checked in).
    pub fn available(&self) -> usize {
        self.inner.idle.lock().len()
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "busy_timeout", 5_000)?;
    Ok(conn)
}

/// RAII checkout; returns the connection to the pool on drop.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Connection>,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.idle.lock().push(conn);
            self.pool.available.notify_one();
        }
    }
}
