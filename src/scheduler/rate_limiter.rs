//! Token-bucket rate limiter shared by the workers of a cohort.
//!
//! The bucket holds up to `requests_per_minute` tokens and refills
//! continuously. Waiters queue on a fair mutex, so pacing is FIFO.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Limits how many driver calls a cohort issues per minute.
pub struct RateLimiter {
    per_minute: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Creates a full bucket allowing `requests_per_minute` calls per minute.
    ///
    /// A value of zero is treated as one.
    pub fn new(requests_per_minute: u32) -> Self {
        let per_minute = f64::from(requests_per_minute.max(1));
        Self {
            per_minute,
            bucket: Mutex::new(Bucket {
                tokens: per_minute,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Returns the configured rate.
    pub fn requests_per_minute(&self) -> f64 {
        self.per_minute
    }

    /// Takes one token, waiting until one is available.
    pub async fn acquire(&self) {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return;
        }

        let wait = Duration::from_secs_f64((1.0 - bucket.tokens) * 60.0 / self.per_minute);
        debug!(wait_ms = wait.as_millis() as u64, "Rate limit reached, waiting for a token");
        tokio::time::sleep(wait).await;

        bucket.tokens = 0.0;
        bucket.last_refill = Instant::now();
    }

    /// Returns the number of whole tokens currently available.
    pub async fn available(&self) -> u32 {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);
        bucket.tokens.floor() as u32
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.per_minute / 60.0).min(self.per_minute);
        bucket.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_starts_full() {
        let limiter = RateLimiter::new(30);
        assert_eq!(limiter.available().await, 30);
        limiter.acquire().await;
        assert_eq!(limiter.available().await, 29);
    }

    #[tokio::test]
    async fn test_zero_rate_is_clamped() {
        let limiter = RateLimiter::new(0);
        assert!((limiter.requests_per_minute() - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_waits_when_empty() {
        // 1200/min = one token every 50ms.
        let limiter = RateLimiter::new(1200);
        for _ in 0..1200 {
            limiter.acquire().await;
        }

        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
