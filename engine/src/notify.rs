//! Outbound notification seam.
//!
//! The engine announces state changes without knowing about sessions or
//! transports; the server wires in an implementation backed by the
//! connection pool. Enqueueing is synchronous and best-effort.

use serde_json::Value;

/// Where engine notifications go.
pub trait NotificationSink: Send + Sync {
    /// Deliver to every live session of one agent. Returns sessions reached.
    fn notify_agent(&self, tenant_id: &str, agent_id: &str, method: &str, params: Value) -> usize;

    /// Deliver once per session subscribed to `topic`.
    fn broadcast(&self, topic: &str, method: &str, params: Value) -> usize;
}

/// Sink that drops everything; used by tests that don't care.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl NotificationSink for NoopSink {
    fn notify_agent(&self, _: &str, _: &str, _: &str, _: Value) -> usize {
        0
    }

    fn broadcast(&self, _: &str, _: &str, _: Value) -> usize {
        0
    }
}

/// Sink that records every call, for assertions in tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub sent: parking_lot::Mutex<Vec<(String, String, Value)>>,
    pub broadcasts: parking_lot::Mutex<Vec<(String, String, Value)>>,
}

impl NotificationSink for RecordingSink {
    fn notify_agent(&self, _tenant_id: &str, agent_id: &str, method: &str, params: Value) -> usize {
        self.sent
            .lock()
            .push((agent_id.to_string(), method.to_string(), params));
        1
    }

    fn broadcast(&self, topic: &str, method: &str, params: Value) -> usize {
        self.broadcasts
            .lock()
            .push((topic.to_string(), method.to_string(), params));
        1
    }
}
