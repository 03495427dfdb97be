//! Per-session circuit breaker.
//!
//! Shields the mesh from a session that keeps producing server-side
//! failures. The breaker opens after a threshold of consecutive failures,
//! rejects calls while open, and lets a single probe through after the
//! cool-down before deciding whether to close again.

use std::time::{Duration, Instant};

use mesh_core::error::{MeshError, Result};

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Rejecting calls until the cool-down elapses
    Open,
    /// One probe call allowed through
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    consecutive_failures: u32,
    state: CircuitState,
    opened_at: Option<Instant>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(30))
    }
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            cooldown,
            consecutive_failures: 0,
            state: CircuitState::Closed,
            opened_at: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Gate a call. While open, fails with `CircuitOpen` carrying the
    /// remaining cool-down; after the cool-down one probe is let through.
    pub fn check(&mut self) -> Result<()> {
        self.check_at(Instant::now())
    }

    fn check_at(&mut self, now: Instant) -> Result<()> {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|at| now.duration_since(at))
                    .unwrap_or_default();
                if elapsed >= self.cooldown {
                    self.state = CircuitState::HalfOpen;
                    Ok(())
                } else {
                    let retry_after_secs =
                        (self.cooldown - elapsed).as_secs().max(1);
                    Err(MeshError::CircuitOpen { retry_after_secs })
                }
            }
        }
    }

    /// Record a successful call; closes the breaker and clears the count.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.state = CircuitState::Closed;
        self.opened_at = None;
    }

    /// Record a failed call. A failed probe reopens immediately.
    pub fn record_failure(&mut self) {
        self.record_failure_at(Instant::now());
    }

    fn record_failure_at(&mut self, now: Instant) {
        self.consecutive_failures += 1;
        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.opened_at = Some(now);
            }
            CircuitState::Closed if self.consecutive_failures >= self.failure_threshold => {
                self.state = CircuitState::Open;
                self.opened_at = Some(now);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_after_threshold() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        let now = Instant::now();

        breaker.check_at(now).unwrap();
        breaker.record_failure_at(now);
        breaker.record_failure_at(now);
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure_at(now);
        assert_eq!(breaker.state(), CircuitState::Open);

        let err = breaker.check_at(now).unwrap_err();
        assert!(matches!(err, MeshError::CircuitOpen { .. }));
    }

    #[test]
    fn test_success_resets_count() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_probe_after_cooldown() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_secs(10));
        let now = Instant::now();
        breaker.record_failure_at(now);
        assert_eq!(breaker.state(), CircuitState::Open);

        // Probe allowed once the cool-down has elapsed.
        let later = now + Duration::from_secs(11);
        breaker.check_at(later).unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Successful probe closes the breaker.
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_failed_probe_reopens() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_secs(10));
        let now = Instant::now();
        breaker.record_failure_at(now);

        let later = now + Duration::from_secs(11);
        breaker.check_at(later).unwrap();
        breaker.record_failure_at(later);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.check_at(later).is_err());
    }
}
