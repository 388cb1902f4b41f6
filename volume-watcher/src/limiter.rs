//! Token bucket limiting how fast the watcher queries the state store.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Token bucket refilled at `rate` tokens per second, holding at most
/// `burst` tokens.
///
/// `wait` reserves a token up front and sleeps until it is due, so callers
/// queue in arrival order and the bucket may run a deficit.
pub struct QueryLimiter {
    rate: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl QueryLimiter {
    pub fn new(rate: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            rate,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }

    /// Reserve a token, returning how long the caller must wait for it.
    fn reserve(&self) -> Duration {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let refill = now.duration_since(bucket.last).as_secs_f64() * self.rate;
        bucket.tokens = (bucket.tokens + refill).min(self.burst);
        bucket.last = now;

        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.rate)
        }
    }

    /// Hand back a token reserved by a wait that never finished.
    fn refund(&self) {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        bucket.tokens = (bucket.tokens + 1.0).min(self.burst);
    }

    /// Wait for a token. Dropping the future before it completes returns
    /// the token to the bucket.
    pub async fn wait(&self) {
        let delay = self.reserve();
        if delay.is_zero() {
            return;
        }
        let mut pending = Reservation {
            limiter: self,
            used: false,
        };
        tokio::time::sleep(delay).await;
        pending.used = true;
    }
}

struct Reservation<'a> {
    limiter: &'a QueryLimiter,
    used: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.used {
            self.limiter.refund();
        }
    }
}
