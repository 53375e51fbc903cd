//! Token-bucket pacing.
//!
//! One bucket paces all calls to one origin (sustained rate plus burst).
//! The serving plane reuses the same bucket for its global and per-IP
//! inbound limits.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// A classic token bucket: `rate` tokens per second refill, `burst` capacity.
pub struct TokenBucket {
    state: Mutex<BucketState>,
    rate: f64,
    burst: f64,
}

struct BucketState {
    tokens: f64,
    refilled_at: Instant,
}

impl TokenBucket {
    /// A bucket starting full.
    pub fn new(rate: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            state: Mutex::new(BucketState {
                tokens: burst,
                refilled_at: Instant::now(),
            }),
            rate: rate.max(f64::MIN_POSITIVE),
            burst,
        }
    }

    /// Takes one token if available; otherwise returns how long to wait
    /// until one will be.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        self.try_acquire_at(Instant::now())
    }

    fn try_acquire_at(&self, now: Instant) -> Result<(), Duration> {
        let mut state = self.state.lock();
        let elapsed = now.duration_since(state.refilled_at).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.refilled_at = now;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - state.tokens;
            Err(Duration::from_secs_f64(deficit / self.rate))
        }
    }

    /// Waits for a token. The lock is never held across the sleep.
    pub async fn acquire(&self) {
        loop {
            match self.try_acquire() {
                Ok(()) => return,
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }
}
