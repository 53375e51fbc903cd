//! Content-hash caching for read responses.
//!
//! The entity tag is the first 16 bytes of the body's SHA-256, hex-encoded,
//! computed over the uncompressed body so it is stable across encodings.
//! Cached entries are post-compression, keyed by (request key, encoding),
//! bounded by entry count, total bytes, and TTL. Evictions increment a
//! counter the 15-second sampler reports as deltas.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::config::ResponseConfig;

/// Computes the entity tag for an uncompressed body.
pub fn etag_of(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    hex::encode(&digest[..16])
}

/// One cached, already-encoded response.
#[derive(Clone)]
pub struct CachedResponse {
    pub body: Arc<Vec<u8>>,
    pub etag: String,
    pub content_type: &'static str,
    pub content_encoding: Option<&'static str>,
    stored_at: Instant,
}

struct CacheInner {
    entries: LruCache<String, CachedResponse>,
    bytes: usize,
}

/// Size- and count-bounded LRU with TTL. The only process-wide mutable
/// state shared between requests.
pub struct ResponseCache {
    inner: Mutex<CacheInner>,
    max_bytes: usize,
    ttl: Duration,
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
}

impl ResponseCache {
    pub fn new(config: &ResponseConfig) -> Arc<Self> {
        let capacity = NonZeroUsize::new(config.cache_max_entries.max(1))
            .expect("max(1) is non-zero");
        Arc::new(Self {
            inner: Mutex::new(CacheInner {
                entries: LruCache::new(capacity),
                bytes: 0,
            }),
            max_bytes: config.cache_max_bytes,
            ttl: config.cache_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    /// Fresh entry for `key`, if any.
    pub fn get(&self, key: &str) -> Option<CachedResponse> {
        let mut inner = self.inner.lock();
        match inner.entries.get(key) {
            Some(entry) if entry.stored_at.elapsed() <= self.ttl => {
                let entry = entry.clone();
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            Some(_) => {
                if let Some(expired) = inner.entries.pop(key) {
                    inner.bytes = inner.bytes.saturating_sub(expired.body.len());
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Stores an encoded response, evicting LRU entries until the byte
    /// bound holds. Bodies larger than the whole cache are not stored.
    pub fn put(
        &self,
        key: String,
        body: Arc<Vec<u8>>,
        etag: String,
        content_type: &'static str,
        content_encoding: Option<&'static str>,
    ) {
        if body.len() > self.max_bytes {
            return;
        }
        let mut inner = self.inner.lock();
        if let Some(previous) = inner.entries.pop(&key) {
            inner.bytes = inner.bytes.saturating_sub(previous.body.len());
        }
        while inner.bytes + body.len() > self.max_bytes {
            match inner.entries.pop_lru() {
                Some((_, evicted)) => {
                    inner.bytes = inner.bytes.saturating_sub(evicted.body.len());
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }
        inner.bytes += body.len();
        if inner
            .entries
            .push(
                key,
                CachedResponse {
                    body,
                    etag,
                    content_type,
                    content_encoding,
                    stored_at: Instant::now(),
                },
            )
            .is_some()
        {
            // push() evicted the LRU entry to make room by count.
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drops everything; new versions invalidate all cached reads.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.bytes = 0;
    }

    /// (hits, misses, evictions) counters.
    pub fn counters(&self) -> (u64, u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.evictions.load(Ordering::Relaxed),
        )
    }

    /// Current entry count and byte usage.
    pub fn usage(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.entries.len(), inner.bytes)
    }
}
