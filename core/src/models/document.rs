use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Fields;
use crate::clock::{HlcTimestamp, VectorClock};

/// Supported document content types.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    Markdown,
    Json,
    Yaml,
    Code,
}

/// Advisory lock on a document. All fields are set together; an absent
/// lock means the document is free.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentLock {
    pub locked_by: String,
    pub locked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl DocumentLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A collaborative artifact inside a workspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SharedDocument {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub tenant_id: String,
    pub title: String,
    pub content_type: ContentType,
    /// Materialized content; the authoritative history lives in the
    /// document's operation stream
    pub content: String,
    pub version: u64,
    pub lock: Option<DocumentLock>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SharedDocument {
    pub fn new(
        workspace_id: Uuid,
        tenant_id: impl Into<String>,
        title: impl Into<String>,
        content_type: ContentType,
        created_by: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            tenant_id: tenant_id.into(),
            title: title.into(),
            content_type,
            content: String::new(),
            version: 1,
            lock: None,
            created_by: created_by.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether `agent_id` currently holds a live lock.
    pub fn is_locked_by(&self, agent_id: &str, now: DateTime<Utc>) -> bool {
        self.lock
            .as_ref()
            .map(|l| !l.is_expired(now) && l.locked_by == agent_id)
            .unwrap_or(false)
    }

    /// Whether another agent holds a live lock.
    pub fn is_locked_against(&self, agent_id: &str, now: DateTime<Utc>) -> bool {
        self.lock
            .as_ref()
            .map(|l| !l.is_expired(now) && l.locked_by != agent_id)
            .unwrap_or(false)
    }
}

/// Kinds of edits applied to a document.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DocOpKind {
    Insert,
    Delete,
    Update,
    Move,
    Format,
}

/// A single CRDT operation against a document. Idempotent: re-applying a
/// known `op_id` changes nothing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentOperation {
    pub op_id: Uuid,
    pub document_id: Uuid,
    pub tenant_id: String,
    pub agent_id: String,
    pub kind: DocOpKind,
    /// Kind-specific payload, e.g. the RGA insert for `insert`
    pub payload: Fields,
    pub ts: HlcTimestamp,
    pub vector: VectorClock,
    /// Monotonic per-document sequence assigned by the store
    pub sequence: u64,
    pub parent_op: Option<Uuid>,
    pub applied: bool,
    pub created_at: DateTime<Utc>,
}
