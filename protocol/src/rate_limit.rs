//! Token-bucket rate limiting, one limiter per session.

use std::collections::HashMap;
use std::time::Instant;

use mesh_core::error::{MeshError, Result};

/// A single token bucket.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: u32) -> Self {
        Self {
            capacity: capacity as f64,
            tokens: capacity as f64,
            refill_per_sec: refill_per_sec as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token, or report how long until one is available.
    pub fn try_acquire(&mut self) -> Result<()> {
        self.try_acquire_at(Instant::now())
    }

    fn try_acquire_at(&mut self, now: Instant) -> Result<()> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        let deficit = 1.0 - self.tokens;
        let retry_after_secs = (deficit / self.refill_per_sec).ceil().max(1.0) as u64;
        Err(MeshError::TooManyRequests { retry_after_secs })
    }

    pub fn available(&self) -> u32 {
        self.tokens as u32
    }
}

/// Named buckets for one session. Handler descriptors choose the bucket by
/// name; unknown names fall back to the default bucket.
#[derive(Debug)]
pub struct RateLimiter {
    default_bucket: TokenBucket,
    buckets: HashMap<String, TokenBucket>,
}

impl RateLimiter {
    pub fn new(default_capacity: u32, default_refill_per_sec: u32) -> Self {
        Self {
            default_bucket: TokenBucket::new(default_capacity, default_refill_per_sec),
            buckets: HashMap::new(),
        }
    }

    /// Register a dedicated bucket.
    pub fn add_bucket(&mut self, name: impl Into<String>, capacity: u32, refill_per_sec: u32) {
        self.buckets
            .insert(name.into(), TokenBucket::new(capacity, refill_per_sec));
    }

    pub fn try_acquire(&mut self, bucket: &str) -> Result<()> {
        match self.buckets.get_mut(bucket) {
            Some(b) => b.try_acquire(),
            None => self.default_bucket.try_acquire(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_bucket_exhaustion_and_retry_after() {
        let mut bucket = TokenBucket::new(100, 100);
        let now = Instant::now();
        for _ in 0..100 {
            bucket.try_acquire_at(now).unwrap();
        }
        // Request 101 within the same instant is rejected.
        let err = bucket.try_acquire_at(now).unwrap_err();
        match err {
            MeshError::TooManyRequests { retry_after_secs } => assert!(retry_after_secs > 0),
            other => panic!("expected TooManyRequests, got {other:?}"),
        }
    }

    #[test]
    fn test_bucket_refills_over_time() {
        let mut bucket = TokenBucket::new(1, 10);
        let start = Instant::now();
        bucket.try_acquire_at(start).unwrap();
        assert!(bucket.try_acquire_at(start).is_err());

        // After 200ms at 10 tokens/sec there is a token again.
        let later = start + Duration::from_millis(200);
        bucket.try_acquire_at(later).unwrap();
    }

    #[test]
    fn test_named_buckets_are_independent() {
        let mut limiter = RateLimiter::new(1, 1);
        limiter.add_bucket("bulk", 2, 1);

        limiter.try_acquire("default-ish").unwrap();
        assert!(limiter.try_acquire("other-default").is_err());

        // The named bucket still has tokens.
        limiter.try_acquire("bulk").unwrap();
        limiter.try_acquire("bulk").unwrap();
        assert!(limiter.try_acquire("bulk").is_err());
    }
}
