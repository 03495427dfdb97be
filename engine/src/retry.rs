//! Retry policy for transient failures.
//!
//! Delay grows quadratically from a 100 ms base with jitter, and only
//! error kinds the taxonomy marks retryable are attempted again.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use mesh_core::error::{MeshError, Result};

/// Base delay before the first retry.
pub const BASE_DELAY_MS: u64 = 100;

/// Delay before retry `attempt` (1-based): quadratic growth with up to
/// 20% jitter.
pub fn backoff_delay(attempt: u32) -> Duration {
    let base = BASE_DELAY_MS * (attempt as u64).pow(2);
    let jitter = rand::thread_rng().gen_range(0..=base / 5);
    Duration::from_millis(base + jitter)
}

/// Bounded retry loop.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// the attempt budget runs out.
    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt + 1 < self.max_attempts => {
                    attempt += 1;
                    let delay = backoff_delay(attempt);
                    debug!(%err, attempt, delay_ms = delay.as_millis() as u64, "retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Classify an error for callers that manage their own loops.
pub fn is_retryable(err: &MeshError) -> bool {
    err.is_retryable()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_grows_quadratically() {
        for _ in 0..10 {
            let d1 = backoff_delay(1).as_millis() as u64;
            let d2 = backoff_delay(2).as_millis() as u64;
            let d3 = backoff_delay(3).as_millis() as u64;
            assert!((100..=120).contains(&d1));
            assert!((400..=480).contains(&d2));
            assert!((900..=1080).contains(&d3));
        }
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let attempts = AtomicU32::new(0);
        let result = RetryPolicy::new(3)
            .run(|| async {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(MeshError::ServiceUnavailable {
                        retry_after_secs: 0,
                    })
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = RetryPolicy::new(5)
            .run(|| async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(MeshError::Forbidden("no".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_budget_is_bounded() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = RetryPolicy::new(3)
            .run(|| async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(MeshError::Timeout("slow".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
