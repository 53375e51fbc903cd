//! Per-endpoint circuit breakers.
//!
//! Closed → open after N consecutive failures; after a cool-down the
//! breaker half-opens and admits a bounded number of probes; M consecutive
//! probe successes close it, any probe failure re-opens it. Callers see
//! `CircuitOpen` as a fast failure instead of a timeout.

use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::error::{Error, Result};

/// Breaker gate states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Thresholds governing one endpoint's breaker.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before probing.
    pub cooldown: Duration,
    /// Probes admitted while half-open.
    pub probe_limit: u32,
    /// Consecutive probe successes that close the breaker.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            probe_limit: 3,
            success_threshold: 2,
        }
    }
}

#[derive(Debug)]
struct EndpointBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    probes_admitted: u32,
    opened_at: Option<Instant>,
}

impl EndpointBreaker {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            probes_admitted: 0,
            opened_at: None,
        }
    }
}

/// Process-scoped breaker map, keyed by upstream endpoint name.
/// Read-mostly; the map itself sits under an RW lock while each endpoint's
/// transitions run under the write half.
pub struct BreakerMap {
    config: BreakerConfig,
    endpoints: RwLock<FxHashMap<String, EndpointBreaker>>,
}

impl BreakerMap {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            endpoints: RwLock::new(FxHashMap::default()),
        }
    }

    /// Admission check before a call. Fast-fails with `CircuitOpen` when the
    /// endpoint is open (or half-open with its probe budget spent).
    pub fn check(&self, endpoint: &str) -> Result<()> {
        self.check_at(endpoint, Instant::now())
    }

    fn check_at(&self, endpoint: &str, now: Instant) -> Result<()> {
        let mut endpoints = self.endpoints.write();
        let breaker = endpoints
            .entry(endpoint.to_string())
            .or_insert_with(EndpointBreaker::new);
        match breaker.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = breaker
                    .opened_at
                    .map(|at| now.duration_since(at))
                    .unwrap_or_default();
                if elapsed >= self.config.cooldown {
                    breaker.state = BreakerState::HalfOpen;
                    breaker.consecutive_successes = 0;
                    breaker.probes_admitted = 1;
                    tracing::info!(endpoint, "circuit breaker half-open, probing");
                    Ok(())
                } else {
                    Err(Error::CircuitOpen {
                        endpoint: endpoint.to_string(),
                    })
                }
            }
            BreakerState::HalfOpen => {
                if breaker.probes_admitted < self.config.probe_limit {
                    breaker.probes_admitted += 1;
                    Ok(())
                } else {
                    Err(Error::CircuitOpen {
                        endpoint: endpoint.to_string(),
                    })
                }
            }
        }
    }

    /// Records a successful call.
    pub fn record_success(&self, endpoint: &str) {
        let mut endpoints = self.endpoints.write();
        let Some(breaker) = endpoints.get_mut(endpoint) else {
            return;
        };
        breaker.consecutive_failures = 0;
        match breaker.state {
            BreakerState::Closed => {}
            BreakerState::HalfOpen => {
                breaker.consecutive_successes += 1;
                if breaker.consecutive_successes >= self.config.success_threshold {
                    breaker.state = BreakerState::Closed;
                    breaker.consecutive_successes = 0;
                    breaker.probes_admitted = 0;
                    breaker.opened_at = None;
                    tracing::info!(endpoint, "circuit breaker closed");
                }
            }
            // A success racing the open transition does not close anything.
            BreakerState::Open => {}
        }
    }

    /// Records a failed call.
    pub fn record_failure(&self, endpoint: &str) {
        self.record_failure_at(endpoint, Instant::now())
    }

    fn record_failure_at(&self, endpoint: &str, now: Instant) {
        let mut endpoints = self.endpoints.write();
        let breaker = endpoints
            .entry(endpoint.to_string())
            .or_insert_with(EndpointBreaker::new);
        match breaker.state {
            BreakerState::Closed => {
                breaker.consecutive_failures += 1;
                if breaker.consecutive_failures >= self.config.failure_threshold {
                    breaker.state = BreakerState::Open;
                    breaker.opened_at = Some(now);
                    tracing::warn!(
                        endpoint,
                        failures = breaker.consecutive_failures,
                        "circuit breaker opened"
                    );
                }
            }
            BreakerState::HalfOpen => {
                breaker.state = BreakerState::Open;
                breaker.opened_at = Some(now);
                breaker.consecutive_successes = 0;
                breaker.probes_admitted = 0;
                tracing::warn!(endpoint, "probe failed, circuit breaker re-opened");
            }
            BreakerState::Open => {}
        }
    }

    /// Current state per endpoint, for health reporting.
    pub fn snapshot(&self) -> Vec<(String, BreakerState)> {
        let endpoints = self.endpoints.read();
        let mut out: Vec<_> = endpoints
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.state))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}
