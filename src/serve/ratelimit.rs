//! Inbound request rate limiting.
//!
//! One global token bucket plus one bucket per client IP, both consulted on
//! every request. Per-IP entries are garbage-collected once idle for longer
//! than the configured expiry; the GC runs on the cleanup period alongside
//! the other background loops.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::config::RateLimitConfig;
use crate::fetch::ratelimit::TokenBucket;

struct IpEntry {
    bucket: TokenBucket,
    last_seen: Instant,
}

/// Process-scoped limiter shared by all request tasks.
pub struct RequestLimiter {
    global: TokenBucket,
    per_ip: Mutex<FxHashMap<IpAddr, IpEntry>>,
    config: RateLimitConfig,
}

impl RequestLimiter {
    pub fn new(config: RateLimitConfig) -> Arc<Self> {
        Arc::new(Self {
            global: TokenBucket::new(config.global_rps, config.global_burst),
            per_ip: Mutex::new(FxHashMap::default()),
            config,
        })
    }

    /// Admits or rejects one request from `ip`. On rejection returns the
    /// suggested `Retry-After`.
    pub fn check(&self, ip: IpAddr) -> Result<(), Duration> {
        self.global.try_acquire()?;
        let mut per_ip = self.per_ip.lock();
        let entry = per_ip.entry(ip).or_insert_with(|| IpEntry {
            bucket: TokenBucket::new(self.config.per_ip_rps, self.config.per_ip_burst),
            last_seen: Instant::now(),
        });
        entry.last_seen = Instant::now();
        entry.bucket.try_acquire()
    }

    /// Drops per-IP entries idle longer than the configured expiry.
    /// Returns how many were collected.
    pub fn collect_idle(&self) -> usize {
        let expiry = self.config.idle_expiry;
        let mut per_ip = self.per_ip.lock();
        let before = per_ip.len();
        per_ip.retain(|_, entry| entry.last_seen.elapsed() <= expiry);
        before - per_ip.len()
    }

    /// GC period, for the background loop.
    pub fn cleanup_period(&self) -> Duration {
        self.config.cleanup_period
    }

    /// Tracked IP count, for stats.
    pub fn tracked_ips(&self) -> usize {
        self.per_ip.lock().len()
    }
}
