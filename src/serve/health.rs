//! Health summary for operators and load balancers.

use serde::{Deserialize, Serialize};

/// Overall status, worst check wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Individual checks contributing to the summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Check {
    StoreReachable {
        healthy: bool,
    },
    QueueBacklog {
        queued: i64,
        threshold: i64,
        healthy: bool,
    },
    CircuitBreakers {
        open: usize,
        healthy: bool,
    },
    PrecalcAge {
        seconds_ago: Option<u64>,
        threshold: u64,
        healthy: bool,
    },
}

/// The assembled report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub checks: Vec<Check>,
}

impl HealthCheck {
    pub fn new() -> Self {
        Self {
            status: HealthStatus::Healthy,
            checks: Vec::new(),
        }
    }

    pub fn add_check(&mut self, check: Check) {
        let is_healthy = match &check {
            Check::StoreReachable { healthy }
            | Check::QueueBacklog { healthy, .. }
            | Check::CircuitBreakers { healthy, .. }
            | Check::PrecalcAge { healthy, .. } => *healthy,
        };

        if !is_healthy {
            self.status = match self.status {
                HealthStatus::Healthy => HealthStatus::Degraded,
                other => other,
            };
            // An unreachable store is an outage, not a degradation.
            if matches!(check, Check::StoreReachable { healthy: false }) {
                self.status = HealthStatus::Unhealthy;
            }
        }

        self.checks.push(check);
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}
