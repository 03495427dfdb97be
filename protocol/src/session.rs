//! Managed sessions.
//!
//! A session exclusively owns one transport channel and is itself owned by
//! the connection pool; everything else refers to sessions by id and
//! borrows a handle through the pool. The state machine runs
//! connecting → authenticated → active, oscillates between active and
//! idle, and funnels into closing → closed on disconnect or eviction.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use mesh_core::error::{MeshError, Result};

use crate::breaker::CircuitBreaker;
use crate::message::WireMessage;
use crate::rate_limit::RateLimiter;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Authenticated,
    Active,
    Idle,
    Closing,
    Closed,
}

impl SessionState {
    /// Check if a session in this state may move to `new_state`.
    pub fn can_transition_to(&self, new_state: SessionState) -> bool {
        use SessionState::*;

        match (self, new_state) {
            (current, new) if *current == new => false,

            (Connecting, Authenticated | Closing) => true,
            (Authenticated, Active | Closing) => true,
            (Active, Idle | Closing) => true,
            (Idle, Active | Closing) => true,
            (Closing, Closed) => true,

            // Closed is terminal
            (Closed, _) => false,

            _ => false,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SessionState::Authenticated | SessionState::Active | SessionState::Idle
        )
    }
}

/// Per-session traffic counters.
#[derive(Debug, Default)]
pub struct SessionCounters {
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
}

/// One managed connection.
pub struct Session {
    pub id: Uuid,
    pub agent_id: String,
    pub tenant_id: String,
    state: Mutex<SessionState>,
    pub counters: SessionCounters,
    last_activity: Mutex<Instant>,
    last_ping: Mutex<Option<Instant>>,
    last_ping_latency: Mutex<Option<Duration>>,
    ping_failures: AtomicU32,
    rate_limiter: Mutex<RateLimiter>,
    breaker: Mutex<CircuitBreaker>,
    subscriptions: Mutex<std::collections::HashSet<String>>,
    outbound: mpsc::Sender<WireMessage>,
}

impl Session {
    pub fn new(
        agent_id: impl Into<String>,
        tenant_id: impl Into<String>,
        rate_limiter: RateLimiter,
        outbound: mpsc::Sender<WireMessage>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            tenant_id: tenant_id.into(),
            state: Mutex::new(SessionState::Connecting),
            counters: SessionCounters::default(),
            last_activity: Mutex::new(Instant::now()),
            last_ping: Mutex::new(None),
            last_ping_latency: Mutex::new(None),
            ping_failures: AtomicU32::new(0),
            rate_limiter: Mutex::new(rate_limiter),
            breaker: Mutex::new(CircuitBreaker::default()),
            subscriptions: Mutex::new(std::collections::HashSet::new()),
            outbound,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Move to `new_state`, validating the transition.
    pub fn transition_to(&self, new_state: SessionState) -> Result<()> {
        let mut state = self.state.lock();
        if !state.can_transition_to(new_state) {
            return Err(MeshError::Conflict(format!(
                "session cannot move from {:?} to {:?}",
                *state, new_state
            )));
        }
        *state = new_state;
        Ok(())
    }

    /// Record inbound traffic, reviving an idle session.
    pub fn touch_inbound(&self, bytes: u64) {
        self.counters.messages_received.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_received.fetch_add(bytes, Ordering::Relaxed);
        *self.last_activity.lock() = Instant::now();

        let mut state = self.state.lock();
        match *state {
            SessionState::Authenticated | SessionState::Idle => *state = SessionState::Active,
            _ => {}
        }
    }

    pub fn touch_outbound(&self, bytes: u64) {
        self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Mark an idle session, driven by the pool's eviction sweep.
    pub fn mark_idle(&self) -> bool {
        let mut state = self.state.lock();
        if *state == SessionState::Active {
            *state = SessionState::Idle;
            true
        } else {
            false
        }
    }

    pub fn record_ping_sent(&self) {
        *self.last_ping.lock() = Some(Instant::now());
    }

    pub fn record_pong(&self) {
        let mut last_ping = self.last_ping.lock();
        if let Some(sent) = last_ping.take() {
            *self.last_ping_latency.lock() = Some(sent.elapsed());
        }
        self.ping_failures.store(0, Ordering::Relaxed);
    }

    pub fn record_ping_failure(&self) -> u32 {
        self.ping_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn ping_failures(&self) -> u32 {
        self.ping_failures.load(Ordering::Relaxed)
    }

    pub fn last_ping_latency(&self) -> Option<Duration> {
        *self.last_ping_latency.lock()
    }

    /// Check the rate bucket for a request.
    pub fn check_rate(&self, bucket: &str) -> Result<()> {
        self.rate_limiter.lock().try_acquire(bucket)
    }

    /// Gate on the circuit breaker.
    pub fn check_breaker(&self) -> Result<()> {
        self.breaker.lock().check()
    }

    pub fn record_outcome(&self, success: bool) {
        let mut breaker = self.breaker.lock();
        if success {
            breaker.record_success();
        } else {
            breaker.record_failure();
        }
    }

    pub fn subscribe(&self, topic: impl Into<String>) {
        self.subscriptions.lock().insert(topic.into());
    }

    pub fn unsubscribe(&self, topic: &str) {
        self.subscriptions.lock().remove(topic);
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.lock().contains(topic)
    }

    /// Enqueue an outbound message without waiting. A full queue means the
    /// session cannot keep up; the caller decides whether to close it.
    pub fn try_enqueue(&self, msg: WireMessage) -> Result<()> {
        self.outbound.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => MeshError::TooManyRequests {
                retry_after_secs: 1,
            },
            mpsc::error::TrySendError::Closed(_) => {
                MeshError::ServiceUnavailable {
                    retry_after_secs: 1,
                }
            }
        })
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("agent_id", &self.agent_id)
            .field("tenant_id", &self.tenant_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> (Session, mpsc::Receiver<WireMessage>) {
        let (tx, rx) = mpsc::channel(4);
        let session = Session::new("agent-a", "t1", RateLimiter::new(100, 100), tx);
        (session, rx)
    }

    #[test]
    fn test_state_machine_happy_path() {
        let (session, _rx) = session();
        assert_eq!(session.state(), SessionState::Connecting);
        session.transition_to(SessionState::Authenticated).unwrap();
        session.touch_inbound(10);
        assert_eq!(session.state(), SessionState::Active);
        session.transition_to(SessionState::Closing).unwrap();
        session.transition_to(SessionState::Closed).unwrap();
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let (session, _rx) = session();
        assert!(session.transition_to(SessionState::Active).is_err());
        session.transition_to(SessionState::Closing).unwrap();
        session.transition_to(SessionState::Closed).unwrap();
        // Closed is terminal.
        assert!(session.transition_to(SessionState::Connecting).is_err());
        assert!(session.transition_to(SessionState::Active).is_err());
    }

    #[test]
    fn test_idle_revives_on_traffic() {
        let (session, _rx) = session();
        session.transition_to(SessionState::Authenticated).unwrap();
        session.touch_inbound(1);
        assert!(session.mark_idle());
        assert_eq!(session.state(), SessionState::Idle);
        session.touch_inbound(1);
        assert_eq!(session.state(), SessionState::Active);
    }

    #[test]
    fn test_enqueue_full_queue_is_backpressure() {
        let (session, _rx) = session();
        for _ in 0..4 {
            session
                .try_enqueue(WireMessage::notification("n", serde_json::json!({})))
                .unwrap();
        }
        let err = session
            .try_enqueue(WireMessage::notification("n", serde_json::json!({})))
            .unwrap_err();
        assert!(matches!(err, MeshError::TooManyRequests { .. }));
    }

    #[test]
    fn test_ping_bookkeeping() {
        let (session, _rx) = session();
        session.record_ping_sent();
        session.record_pong();
        assert!(session.last_ping_latency().is_some());
        assert_eq!(session.ping_failures(), 0);

        session.record_ping_sent();
        assert_eq!(session.record_ping_failure(), 1);
        assert_eq!(session.record_ping_failure(), 2);
    }
}
