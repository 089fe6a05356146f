//! Rate Limiter (C7): a hand-rolled token bucket guarding inbound tool calls.
//!
//! No crate in the example pack reaches for a dedicated rate-limiting
//! library; this follows the pack's habit of small `Arc<Mutex<_>>`-guarded
//! state machines for exactly this kind of self-contained counter.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;

struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            tokens: capacity as f64,
            capacity: capacity as f64,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Try to consume one token. Returns `Ok(())` if one was available, or
    /// `Err(retry_after)` with the wait until the next token would be ready.
    fn try_consume(&mut self) -> Result<(), Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            let wait_secs = deficit / self.refill_per_sec;
            Err(Duration::from_secs_f64(wait_secs.max(0.0)))
        }
    }
}

/// Token-bucket rate limiter: capacity `burst`, refill `per_minute / 60`
/// tokens per second. Each inbound tool call consumes one token.
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(burst: u32, per_minute: u32) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(burst, per_minute as f64 / 60.0)),
        }
    }

    /// Attempt to consume one token. `Err` carries the caller-facing
    /// retry-after hint, rounded up to whole seconds.
    pub async fn check(&self) -> Result<(), Duration> {
        let mut bucket = self.bucket.lock().await;
        bucket.try_consume().map_err(|wait| {
            let secs = wait.as_secs_f64().ceil() as u64;
            Duration::from_secs(secs.max(1))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_capacity_is_consumable_immediately() {
        let limiter = RateLimiter::new(3, 60);
        assert!(limiter.check().await.is_ok());
        assert!(limiter.check().await.is_ok());
        assert!(limiter.check().await.is_ok());
        assert!(limiter.check().await.is_err());
    }

    #[tokio::test]
    async fn exhausted_bucket_reports_retry_after() {
        let limiter = RateLimiter::new(1, 60);
        limiter.check().await.unwrap();
        let err = limiter.check().await.unwrap_err();
        assert!(err.as_secs() >= 1);
    }

    #[tokio::test]
    async fn bucket_refills_over_time() {
        let limiter = RateLimiter::new(1, 6000);
        limiter.check().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(limiter.check().await.is_ok());
    }
}
