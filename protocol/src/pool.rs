//! Connection pool.
//!
//! Sole owner of every session. Enforces the global, per-tenant, and
//! per-agent connection caps, drives the heartbeat and idle-eviction
//! sweeps as background tasks, and fans broadcasts out to subscribed
//! sessions. Other components hold only session ids and borrow handles
//! here.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use mesh_core::error::{MeshError, Result};

use crate::message::WireMessage;
use crate::rate_limit::RateLimiter;
use crate::session::{Session, SessionState};

/// Pool limits and timers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub max_per_tenant: usize,
    pub max_per_agent: usize,
    pub idle_timeout: Duration,
    pub ping_interval: Duration,
    /// Unanswered pings before a session is closed
    pub max_ping_failures: u32,
    /// Default per-session rate bucket
    pub rate_capacity: u32,
    pub rate_refill_per_sec: u32,
    /// Outbound queue length per session
    pub outbound_queue: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            max_per_tenant: 1_000,
            max_per_agent: 16,
            idle_timeout: Duration::from_secs(300),
            ping_interval: Duration::from_secs(30),
            max_ping_failures: 3,
            rate_capacity: 100,
            rate_refill_per_sec: 100,
            outbound_queue: 256,
        }
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolStats {
    pub total_sessions: usize,
    pub active_sessions: usize,
    pub idle_sessions: usize,
}

/// The pool itself. Clone handles freely; all clones share state.
pub struct ConnectionPool {
    config: PoolConfig,
    sessions: DashMap<Uuid, Arc<Session>>,
    cancel: CancellationToken,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            sessions: DashMap::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Admit a new connection for `agent_id` under `tenant_id`.
    ///
    /// Enforces the three caps in order: global, tenant, agent. Returns
    /// the owned session handle and the receiving end of its outbound
    /// queue, which the transport writer loop drains.
    pub fn register(
        &self,
        agent_id: &str,
        tenant_id: &str,
    ) -> Result<(Arc<Session>, mpsc::Receiver<WireMessage>)> {
        if self.sessions.len() >= self.config.max_connections {
            return Err(MeshError::PoolFull);
        }
        let tenant_count = self
            .sessions
            .iter()
            .filter(|entry| entry.value().tenant_id == tenant_id)
            .count();
        if tenant_count >= self.config.max_per_tenant {
            return Err(MeshError::TenantLimit(tenant_id.to_string()));
        }
        let agent_count = self
            .sessions
            .iter()
            .filter(|entry| {
                entry.value().tenant_id == tenant_id && entry.value().agent_id == agent_id
            })
            .count();
        if agent_count >= self.config.max_per_agent {
            return Err(MeshError::AgentLimit(agent_id.to_string()));
        }

        let (tx, rx) = mpsc::channel(self.config.outbound_queue);
        let limiter = RateLimiter::new(self.config.rate_capacity, self.config.rate_refill_per_sec);
        let session = Arc::new(Session::new(agent_id, tenant_id, limiter, tx));
        self.sessions.insert(session.id, session.clone());
        info!(session_id = %session.id, agent_id, tenant_id, "session registered");
        Ok((session, rx))
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    /// Live sessions bound to an agent.
    pub fn sessions_for_agent(&self, tenant_id: &str, agent_id: &str) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .filter(|entry| {
                let s = entry.value();
                s.tenant_id == tenant_id && s.agent_id == agent_id && s.state().is_live()
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Remove and close a session.
    pub fn remove(&self, id: Uuid) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove(&id)?;
        let state = session.state();
        if state != SessionState::Closed {
            let _ = session.transition_to(SessionState::Closing);
            let _ = session.transition_to(SessionState::Closed);
        }
        info!(session_id = %id, "session removed");
        Some(session)
    }

    /// Deliver a message to every session subscribed to `topic`, once per
    /// session, in each session's enqueue order. Returns the number of
    /// sessions reached.
    pub fn broadcast(&self, topic: &str, msg: &WireMessage) -> usize {
        let mut delivered = 0;
        for entry in self.sessions.iter() {
            let session = entry.value();
            if session.state().is_live() && session.is_subscribed(topic) {
                match session.try_enqueue(msg.clone()) {
                    Ok(()) => delivered += 1,
                    Err(err) => {
                        warn!(session_id = %session.id, %err, "broadcast enqueue failed");
                    }
                }
            }
        }
        delivered
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            total_sessions: self.sessions.len(),
            ..Default::default()
        };
        for entry in self.sessions.iter() {
            match entry.value().state() {
                SessionState::Active | SessionState::Authenticated => stats.active_sessions += 1,
                SessionState::Idle => stats.idle_sessions += 1,
                _ => {}
            }
        }
        stats
    }

    /// Token cancelled on shutdown; background sweeps watch it.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
        let ids: Vec<Uuid> = self.sessions.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.remove(id);
        }
    }

    /// Spawn the heartbeat sweep: sends a ping to every live session each
    /// interval and closes sessions past the failure budget.
    pub fn spawn_heartbeat(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = self;
        let cancel = pool.cancel.child_token();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(pool.config.ping_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => pool.heartbeat_sweep(),
                }
            }
            debug!("heartbeat sweep stopped");
        })
    }

    fn heartbeat_sweep(&self) {
        let ping = WireMessage::notification("ping", json!({}));
        let mut doomed = Vec::new();
        for entry in self.sessions.iter() {
            let session = entry.value();
            if !session.state().is_live() {
                continue;
            }
            session.record_ping_sent();
            if session.try_enqueue(ping.clone()).is_err() {
                let failures = session.record_ping_failure();
                if failures >= self.config.max_ping_failures {
                    doomed.push(session.id);
                }
            }
        }
        for id in doomed {
            warn!(session_id = %id, "session unresponsive, closing");
            self.remove(id);
        }
    }

    /// Spawn the idle sweep: marks quiet sessions idle and evicts sessions
    /// idle past the timeout.
    pub fn spawn_idle_eviction(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = self;
        let cancel = pool.cancel.child_token();
        tokio::spawn(async move {
            let sweep_every = pool.config.idle_timeout / 4;
            let mut interval = tokio::time::interval(sweep_every.max(Duration::from_secs(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => pool.idle_sweep(),
                }
            }
            debug!("idle sweep stopped");
        })
    }

    fn idle_sweep(&self) {
        let mut doomed = Vec::new();
        for entry in self.sessions.iter() {
            let session = entry.value();
            let idle = session.idle_for();
            if idle >= self.config.idle_timeout {
                doomed.push(session.id);
            } else if idle >= self.config.idle_timeout / 2 {
                session.mark_idle();
            }
        }
        for id in doomed {
            info!(session_id = %id, "idle timeout, evicting session");
            self.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(max: usize, per_tenant: usize, per_agent: usize) -> Arc<ConnectionPool> {
        ConnectionPool::new(PoolConfig {
            max_connections: max,
            max_per_tenant: per_tenant,
            max_per_agent: per_agent,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_global_cap() {
        let pool = pool_with(2, 10, 10);
        pool.register("a1", "t1").unwrap();
        pool.register("a2", "t1").unwrap();
        let err = pool.register("a3", "t1").unwrap_err();
        assert_eq!(err, MeshError::PoolFull);
    }

    #[tokio::test]
    async fn test_tenant_cap() {
        let pool = pool_with(10, 2, 10);
        pool.register("a1", "t1").unwrap();
        pool.register("a2", "t1").unwrap();
        let err = pool.register("a3", "t1").unwrap_err();
        assert!(matches!(err, MeshError::TenantLimit(_)));
        // Another tenant is unaffected.
        pool.register("a1", "t2").unwrap();
    }

    #[tokio::test]
    async fn test_agent_cap() {
        let pool = pool_with(10, 10, 1);
        pool.register("a1", "t1").unwrap();
        let err = pool.register("a1", "t1").unwrap_err();
        assert!(matches!(err, MeshError::AgentLimit(_)));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers_once() {
        let pool = pool_with(10, 10, 10);
        let (s1, mut rx1) = pool.register("a1", "t1").unwrap();
        let (s2, mut rx2) = pool.register("a2", "t1").unwrap();
        s1.transition_to(SessionState::Authenticated).unwrap();
        s2.transition_to(SessionState::Authenticated).unwrap();

        s1.subscribe("workspace:w1");

        let msg = WireMessage::notification("workspace.updated", json!({"v": 2}));
        let delivered = pool.broadcast("workspace:w1", &msg);
        assert_eq!(delivered, 1);

        assert_eq!(rx1.try_recv().unwrap(), msg);
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remove_closes_session() {
        let pool = pool_with(10, 10, 10);
        let (session, _rx) = pool.register("a1", "t1").unwrap();
        let id = session.id;
        let removed = pool.remove(id).unwrap();
        assert_eq!(removed.state(), SessionState::Closed);
        assert!(pool.get(id).is_none());
        // Slot is freed.
        pool.register("a1", "t1").unwrap();
    }

    #[tokio::test]
    async fn test_sessions_for_agent_filters_live() {
        let pool = pool_with(10, 10, 10);
        let (s1, _rx1) = pool.register("a1", "t1").unwrap();
        let (_s2, _rx2) = pool.register("a1", "t1").unwrap();
        s1.transition_to(SessionState::Authenticated).unwrap();

        // Only the authenticated session counts as live.
        let live = pool.sessions_for_agent("t1", "a1");
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, s1.id);
    }
}
