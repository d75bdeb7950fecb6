//! Token-bucket rate limiting for outbound deliveries

use parking_lot::Mutex;
use policywatch_core::{Error, Result};
use std::time::Duration;
use tokio::time::Instant;

/// Default bound on how long a delivery waits for a token
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Token bucket with capacity 1, refilled at `requests_per_minute / 60` tokens per second.
///
/// Each handler owns one bucket; buckets are never shared between categories.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
    refill_rate: f64,
    max_tokens: f64,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(requests_per_minute: u32) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: 1.0,
                last_refill: Instant::now(),
            }),
            refill_rate: f64::from(requests_per_minute) / 60.0,
            max_tokens: 1.0,
        }
    }

    /// Configured refill rate in tokens per second
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Try to consume one token without waiting.
    ///
    /// On failure returns how long until a token becomes available.
    pub fn try_acquire(&self) -> std::result::Result<(), Duration> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            return Ok(());
        }

        if self.refill_rate <= 0.0 {
            return Err(Duration::MAX);
        }
        let missing = 1.0 - state.tokens;
        Err(Duration::from_secs_f64(missing / self.refill_rate))
    }

    /// Wait for a token, giving up with `RateLimitExceeded` once `timeout` would be exceeded
    pub async fn acquire(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let wait = match self.try_acquire() {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };

            let now = Instant::now();
            if wait == Duration::MAX || now + wait > deadline {
                return Err(Error::RateLimitExceeded(format!(
                    "no token available within {:?}",
                    timeout
                )));
            }
            tokio::time::sleep(wait).await;
        }
    }
}
