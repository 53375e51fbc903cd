//! In-process server counters.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

/// Atomic counters shared across request tasks and background loops.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    pub requests_total: AtomicU64,
    pub responses_2xx: AtomicU64,
    pub responses_4xx: AtomicU64,
    pub responses_5xx: AtomicU64,
    pub not_modified: AtomicU64,
    pub rate_limited: AtomicU64,
    pub timeouts: AtomicU64,
    pub ws_connected: AtomicI64,
    pub ws_messages_sent: AtomicU64,
    pub ws_clients_lagged: AtomicU64,
    pub crawls_succeeded: AtomicU64,
    pub crawls_failed: AtomicU64,
}

/// Serializable snapshot for `/api/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct ServerMetricsSnapshot {
    pub requests_total: u64,
    pub responses_2xx: u64,
    pub responses_4xx: u64,
    pub responses_5xx: u64,
    pub not_modified: u64,
    pub rate_limited: u64,
    pub timeouts: u64,
    pub ws_connected: i64,
    pub ws_messages_sent: u64,
    pub ws_clients_lagged: u64,
    pub crawls_succeeded: u64,
    pub crawls_failed: u64,
}

impl ServerMetrics {
    pub fn snapshot(&self) -> ServerMetricsSnapshot {
        ServerMetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            responses_2xx: self.responses_2xx.load(Ordering::Relaxed),
            responses_4xx: self.responses_4xx.load(Ordering::Relaxed),
            responses_5xx: self.responses_5xx.load(Ordering::Relaxed),
            not_modified: self.not_modified.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            ws_connected: self.ws_connected.load(Ordering::Relaxed),
            ws_messages_sent: self.ws_messages_sent.load(Ordering::Relaxed),
            ws_clients_lagged: self.ws_clients_lagged.load(Ordering::Relaxed),
            crawls_succeeded: self.crawls_succeeded.load(Ordering::Relaxed),
            crawls_failed: self.crawls_failed.load(Ordering::Relaxed),
        }
    }

    pub fn record_status(&self, status: u16) {
        match status {
            200..=299 => self.responses_2xx.fetch_add(1, Ordering::Relaxed),
            304 => self.not_modified.fetch_add(1, Ordering::Relaxed),
            400..=499 => self.responses_4xx.fetch_add(1, Ordering::Relaxed),
            _ => self.responses_5xx.fetch_add(1, Ordering::Relaxed),
        };
    }
}
