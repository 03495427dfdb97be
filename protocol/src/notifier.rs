//! Notification fan-out.
//!
//! Two primitives: targeted sends to every live session of one agent, and
//! topic broadcasts to subscribed sessions. Delivery is at-least-once and
//! best-effort; ordering holds per (topic, session) because each session's
//! outbound queue is FIFO.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::message::WireMessage;
use crate::pool::ConnectionPool;

/// Well-known topic names.
pub fn workspace_topic(id: impl std::fmt::Display) -> String {
    format!("workspace:{id}")
}

pub fn document_topic(id: impl std::fmt::Display) -> String {
    format!("document:{id}")
}

pub fn task_topic(id: impl std::fmt::Display) -> String {
    format!("task:{id}")
}

pub fn workflow_topic(id: impl std::fmt::Display) -> String {
    format!("workflow:{id}")
}

/// Fan-out over the pool's sessions.
#[derive(Clone)]
pub struct Notifier {
    pool: Arc<ConnectionPool>,
}

impl Notifier {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    /// Deliver a notification to every live session bound to `agent_id`.
    /// Returns the number of sessions reached.
    pub fn send_notification(
        &self,
        tenant_id: &str,
        agent_id: &str,
        method: &str,
        params: Value,
    ) -> usize {
        let msg = WireMessage::notification(method, params);
        let sessions = self.pool.sessions_for_agent(tenant_id, agent_id);
        let mut delivered = 0;
        for session in sessions {
            if session.try_enqueue(msg.clone()).is_ok() {
                delivered += 1;
            }
        }
        debug!(agent_id, method, delivered, "notification sent");
        delivered
    }

    /// Deliver once to every session subscribed to `topic`.
    pub fn broadcast(&self, topic: &str, method: &str, params: Value) -> usize {
        let msg = WireMessage::notification(method, params);
        let delivered = self.pool.broadcast(topic, &msg);
        debug!(topic, method, delivered, "broadcast sent");
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use crate::session::SessionState;
    use serde_json::json;

    #[tokio::test]
    async fn test_send_reaches_all_agent_sessions() {
        let pool = ConnectionPool::new(PoolConfig::default());
        let notifier = Notifier::new(pool.clone());

        let (s1, mut rx1) = pool.register("agent-a", "t1").unwrap();
        let (s2, mut rx2) = pool.register("agent-a", "t1").unwrap();
        let (_s3, mut rx3) = pool.register("agent-b", "t1").unwrap();
        s1.transition_to(SessionState::Authenticated).unwrap();
        s2.transition_to(SessionState::Authenticated).unwrap();

        let delivered =
            notifier.send_notification("t1", "agent-a", "task.assigned", json!({"task": "t"}));
        assert_eq!(delivered, 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
        assert!(rx3.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_order_per_session() {
        let pool = ConnectionPool::new(PoolConfig::default());
        let notifier = Notifier::new(pool.clone());

        let (session, mut rx) = pool.register("agent-a", "t1").unwrap();
        session.transition_to(SessionState::Authenticated).unwrap();
        session.subscribe(&document_topic("d1"));

        for i in 0..5 {
            notifier.broadcast(&document_topic("d1"), "document.op", json!({"seq": i}));
        }
        for i in 0..5 {
            let msg = rx.try_recv().unwrap();
            assert_eq!(msg.params.unwrap()["seq"], i);
        }
    }

    #[tokio::test]
    async fn test_topic_name_builders() {
        assert_eq!(workspace_topic("w1"), "workspace:w1");
        assert_eq!(document_topic("d1"), "document:d1");
        assert_eq!(task_topic("t1"), "task:t1");
        assert_eq!(workflow_topic("f1"), "workflow:f1");
    }
}
