//! Shared document runtime.
//!
//! Text documents are backed by an RGA sequence; every edit becomes a
//! `DocumentOperation` stamped with an HLC timestamp and a vector clock,
//! journaled, persisted with a monotonic sequence number, and broadcast
//! to the document's topic. Locks are advisory: a live lock held by
//! someone else rejects the edit, an expired lock is released by whoever
//! observes it first.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, info};
use uuid::Uuid;

use mesh_core::clock::{HlcTimestamp, HybridLogicalClock, VectorClock};
use mesh_core::crdt::{ElementId, Rga, RgaOp};
use mesh_core::error::{MeshError, Result};
use mesh_core::models::{
    ContentType, DocOpKind, DocumentLock, DocumentOperation, Fields, SharedDocument,
};
use mesh_core::oplog::OperationLog;
use mesh_core::repository::DocumentRepository;

use crate::notify::NotificationSink;
use crate::recorder::AuditRecorder;

fn document_topic(id: Uuid) -> String {
    format!("document:{id}")
}

/// Default lock lifetime when the caller does not pick one.
pub const DEFAULT_LOCK_SECS: i64 = 300;

struct DocState {
    rga: Rga,
    vector: VectorClock,
    applied_ops: HashSet<Uuid>,
}

impl DocState {
    fn new() -> Self {
        Self {
            rga: Rga::new(),
            vector: VectorClock::new(),
            applied_ops: HashSet::new(),
        }
    }
}

/// The document service.
pub struct DocumentService {
    documents: Arc<dyn DocumentRepository>,
    oplog: OperationLog,
    recorder: AuditRecorder,
    sink: Arc<dyn NotificationSink>,
    clock: Arc<HybridLogicalClock>,
    /// Live CRDT state per document; the exclusive section for applies
    states: Mutex<HashMap<Uuid, DocState>>,
}

impl DocumentService {
    pub fn new(
        documents: Arc<dyn DocumentRepository>,
        oplog: OperationLog,
        recorder: AuditRecorder,
        sink: Arc<dyn NotificationSink>,
        clock: Arc<HybridLogicalClock>,
    ) -> Self {
        Self {
            documents,
            oplog,
            recorder,
            sink,
            clock,
            states: Mutex::new(HashMap::new()),
        }
    }

    async fn load(&self, tenant_id: &str, id: Uuid) -> Result<SharedDocument> {
        self.documents
            .get(tenant_id, id)
            .await?
            .ok_or_else(|| MeshError::not_found("document", id))
    }

    pub async fn create(
        &self,
        tenant_id: &str,
        workspace_id: Uuid,
        title: &str,
        content_type: ContentType,
        created_by: &str,
    ) -> Result<SharedDocument> {
        if title.trim().is_empty() {
            return Err(MeshError::Validation("document title cannot be empty".into()));
        }
        let document =
            SharedDocument::new(workspace_id, tenant_id, title, content_type, created_by);
        let stored = self.documents.create(document).await?;
        self.states.lock().insert(stored.id, DocState::new());

        self.recorder
            .insert(tenant_id, "document", stored.id, &stored, created_by)
            .await;
        info!(document_id = %stored.id, title, "document created");
        Ok(stored)
    }

    pub async fn get(&self, tenant_id: &str, id: Uuid) -> Result<SharedDocument> {
        self.load(tenant_id, id).await
    }

    /// Whole-content update with an observed version, for non-text
    /// documents or bulk replaces. Rejected while someone else holds a
    /// live lock.
    pub async fn update_content(
        &self,
        tenant_id: &str,
        id: Uuid,
        agent_id: &str,
        content: String,
        observed_version: u64,
    ) -> Result<SharedDocument> {
        let mut document = self.release_if_expired(self.load(tenant_id, id).await?);
        if document.is_locked_against(agent_id, Utc::now()) {
            return Err(MeshError::Conflict("document is locked".into()));
        }
        if document.version != observed_version {
            return Err(MeshError::stale_version(observed_version, document.version));
        }

        let old = document.clone();
        document.content = content;
        let stored = self
            .documents
            .update_with_version(document, observed_version)
            .await?;

        self.recorder
            .update(tenant_id, "document", stored.id, &old, &stored, agent_id)
            .await;
        self.sink.broadcast(
            &document_topic(id),
            "document.updated",
            json!({ "document_id": id, "version": stored.version }),
        );
        Ok(stored)
    }

    // ------------------------------------------------------------------
    // Locks

    /// Take or extend the advisory lock.
    pub async fn lock(
        &self,
        tenant_id: &str,
        id: Uuid,
        agent_id: &str,
        duration_secs: Option<i64>,
    ) -> Result<SharedDocument> {
        let document = self.release_if_expired(self.load(tenant_id, id).await?);
        let now = Utc::now();
        if document.is_locked_against(agent_id, now) {
            return Err(MeshError::Conflict(format!(
                "document is locked by '{}'",
                document
                    .lock
                    .as_ref()
                    .map(|l| l.locked_by.as_str())
                    .unwrap_or("unknown")
            )));
        }

        let expected = document.version;
        let mut updated = document;
        updated.lock = Some(DocumentLock {
            locked_by: agent_id.to_string(),
            locked_at: now,
            expires_at: now + ChronoDuration::seconds(duration_secs.unwrap_or(DEFAULT_LOCK_SECS)),
        });
        let stored = self.documents.update_with_version(updated, expected).await?;

        self.sink.broadcast(
            &document_topic(id),
            "document.locked",
            json!({ "document_id": id, "locked_by": agent_id }),
        );
        Ok(stored)
    }

    /// Release the lock. Only the holder may unlock a live lock.
    pub async fn unlock(&self, tenant_id: &str, id: Uuid, agent_id: &str) -> Result<SharedDocument> {
        let document = self.release_if_expired(self.load(tenant_id, id).await?);
        let now = Utc::now();
        match &document.lock {
            None => Ok(document),
            Some(lock) if lock.locked_by != agent_id && !lock.is_expired(now) => Err(
                MeshError::Forbidden("only the lock holder may unlock".into()),
            ),
            Some(_) => {
                let expected = document.version;
                let mut updated = document;
                updated.lock = None;
                let stored = self.documents.update_with_version(updated, expected).await?;
                self.sink.broadcast(
                    &document_topic(id),
                    "document.unlocked",
                    json!({ "document_id": id }),
                );
                Ok(stored)
            }
        }
    }

    /// Expired locks are released lazily by the first observer; grace
    /// writes that landed before observation stay intact.
    fn release_if_expired(&self, mut document: SharedDocument) -> SharedDocument {
        if let Some(lock) = &document.lock {
            if lock.is_expired(Utc::now()) {
                debug!(document_id = %document.id, "releasing expired lock");
                document.lock = None;
            }
        }
        document
    }

    // ------------------------------------------------------------------
    // CRDT operations

    /// Apply one operation to the document.
    ///
    /// The payload either carries a replicated sequence operation under
    /// `op` (idempotent by element id) or a positional edit: `position`
    /// plus `value` for inserts, `position` alone for deletes. Re-applying
    /// a known `op_id` is a no-op returning the stored operation.
    #[allow(clippy::too_many_arguments)]
    pub async fn apply_operation(
        &self,
        tenant_id: &str,
        id: Uuid,
        agent_id: &str,
        kind: DocOpKind,
        payload: Fields,
        op_id: Option<Uuid>,
        parent_op: Option<Uuid>,
    ) -> Result<DocumentOperation> {
        let document = self.release_if_expired(self.load(tenant_id, id).await?);
        if document.is_locked_against(agent_id, Utc::now()) {
            return Err(MeshError::Conflict("document is locked".into()));
        }

        let op_id = op_id.unwrap_or_else(Uuid::new_v4);

        // Exclusive critical section over the document's CRDT state.
        let staged = {
            let mut states = self.states.lock();
            let state = states.entry(id).or_insert_with(DocState::new);

            if state.applied_ops.contains(&op_id) {
                None
            } else {
                let rga_op = self.translate(&mut state.rga, agent_id, kind, &payload)?;
                if let Some(op) = &rga_op {
                    state.rga.apply(op.clone());
                }
                state.vector.increment(self.clock.node_id());
                state.applied_ops.insert(op_id);
                Some((
                    rga_op,
                    state.rga.content(),
                    state.vector.clone(),
                    self.clock.now(),
                ))
            }
        };
        let (rga_op, content, vector, ts) = match staged {
            Some(staged) => staged,
            // A replay of a known operation changes nothing.
            None => {
                return self
                    .find_existing_op(tenant_id, id, op_id)
                    .await?
                    .ok_or_else(|| MeshError::not_found("operation", op_id));
            }
        };

        let mut stored_payload = payload.clone();
        if let Some(op) = &rga_op {
            stored_payload.insert(
                "op".to_string(),
                serde_json::to_value(op)
                    .map_err(|e| MeshError::Internal(format!("op encode failed: {e}")))?,
            );
        }

        let operation = DocumentOperation {
            op_id,
            document_id: id,
            tenant_id: tenant_id.to_string(),
            agent_id: agent_id.to_string(),
            kind,
            payload: stored_payload.clone(),
            ts: ts.clone(),
            vector,
            sequence: 0,
            parent_op,
            applied: true,
            created_at: Utc::now(),
        };
        let operation = self.documents.append_operation(operation).await?;

        // Refresh the materialized content; retry the version race.
        for _ in 0..5 {
            let current = self.load(tenant_id, id).await?;
            let expected = current.version;
            let mut updated = current;
            updated.content = content.clone();
            match self.documents.update_with_version(updated, expected).await {
                Ok(_) => break,
                Err(MeshError::OptimisticLock { .. }) => continue,
                Err(err) => return Err(err),
            }
        }

        if let Err(err) = self.oplog.append(
            document_topic(id),
            agent_id,
            match kind {
                DocOpKind::Insert => "insert",
                DocOpKind::Delete => "delete",
                DocOpKind::Update => "update",
                DocOpKind::Move => "move",
                DocOpKind::Format => "format",
            },
            &Value::Object(stored_payload),
        ) {
            tracing::warn!(%err, document_id = %id, "oplog append failed");
        }

        self.sink.broadcast(
            &document_topic(id),
            "document.operation",
            json!({
                "document_id": id,
                "op_id": operation.op_id,
                "sequence": operation.sequence,
                "agent_id": agent_id,
            }),
        );
        Ok(operation)
    }

    /// Turn a positional or replicated payload into a sequence operation.
    fn translate(
        &self,
        rga: &mut Rga,
        _agent_id: &str,
        kind: DocOpKind,
        payload: &Fields,
    ) -> Result<Option<RgaOp>> {
        // Replicated form: the payload already carries the operation.
        if let Some(raw) = payload.get("op") {
            let op: RgaOp = serde_json::from_value(raw.clone())
                .map_err(|e| MeshError::InvalidParams(format!("bad sequence op: {e}")))?;
            return Ok(Some(op));
        }

        match kind {
            DocOpKind::Insert => {
                let position = payload
                    .get("position")
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| {
                        MeshError::InvalidParams("insert needs a position".into())
                    })? as usize;
                let value = payload
                    .get("value")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| MeshError::InvalidParams("insert needs a value".into()))?;
                let after = if position == 0 {
                    None
                } else {
                    Some(rga.id_at(position - 1).ok_or_else(|| {
                        MeshError::InvalidParams(format!("position {position} out of range"))
                    })?)
                };
                Ok(Some(RgaOp::Insert {
                    id: ElementId::new(self.clock.now()),
                    after,
                    value: value.to_string(),
                }))
            }
            DocOpKind::Delete => {
                let position = payload
                    .get("position")
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| {
                        MeshError::InvalidParams("delete needs a position".into())
                    })? as usize;
                let target = rga.id_at(position).ok_or_else(|| {
                    MeshError::InvalidParams(format!("position {position} out of range"))
                })?;
                Ok(Some(RgaOp::Delete { target }))
            }
            // Update, move, and format carry their payload through without
            // touching the sequence.
            _ => Ok(None),
        }
    }

    async fn find_existing_op(
        &self,
        tenant_id: &str,
        document_id: Uuid,
        op_id: Uuid,
    ) -> Result<Option<DocumentOperation>> {
        let ops = self
            .documents
            .operations_since(tenant_id, document_id, 0)
            .await?;
        Ok(ops.into_iter().find(|op| op.op_id == op_id))
    }

    /// Operations after `sequence`, for catch-up and replication.
    pub async fn operations_since(
        &self,
        tenant_id: &str,
        id: Uuid,
        after: u64,
    ) -> Result<Vec<DocumentOperation>> {
        self.load(tenant_id, id).await?;
        self.documents.operations_since(tenant_id, id, after).await
    }

    /// Current materialized text for a document.
    pub fn materialized_content(&self, id: Uuid) -> Option<String> {
        self.states.lock().get(&id).map(|s| s.rga.content())
    }

    /// Collect tombstones older than `before` across every live document.
    /// Returns the number of nodes dropped.
    pub fn gc(&self, before: &HlcTimestamp) -> usize {
        let mut states = self.states.lock();
        states.values_mut().map(|s| s.rga.gc(before)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::RecordingSink;
    use mesh_core::oplog::OplogConfig;
    use mesh_storage::{MemoryAuditRepository, MemoryDocumentRepository};

    async fn service() -> DocumentService {
        let clock = Arc::new(HybridLogicalClock::with_default_drift("n1"));
        DocumentService::new(
            Arc::new(MemoryDocumentRepository::new()),
            OperationLog::new(clock.clone(), OplogConfig::default()),
            AuditRecorder::new(Arc::new(MemoryAuditRepository::new())),
            Arc::new(RecordingSink::default()),
            clock,
        )
    }

    fn insert_payload(position: u64, value: &str) -> Fields {
        let mut payload = Fields::new();
        payload.insert("position".into(), json!(position));
        payload.insert("value".into(), json!(value));
        payload
    }

    #[tokio::test]
    async fn test_insert_and_delete_materialize() {
        let svc = service().await;
        let doc = svc
            .create("t1", Uuid::new_v4(), "notes", ContentType::Text, "agent-a")
            .await
            .unwrap();

        for (i, ch) in ["h", "e", "y"].iter().enumerate() {
            svc.apply_operation(
                "t1",
                doc.id,
                "agent-a",
                DocOpKind::Insert,
                insert_payload(i as u64, ch),
                None,
                None,
            )
            .await
            .unwrap();
        }
        assert_eq!(svc.materialized_content(doc.id).unwrap(), "hey");

        let mut delete = Fields::new();
        delete.insert("position".into(), json!(1));
        svc.apply_operation("t1", doc.id, "agent-a", DocOpKind::Delete, delete, None, None)
            .await
            .unwrap();
        assert_eq!(svc.materialized_content(doc.id).unwrap(), "hy");

        let stored = svc.get("t1", doc.id).await.unwrap();
        assert_eq!(stored.content, "hy");
    }

    #[tokio::test]
    async fn test_reapply_known_op_is_noop() {
        let svc = service().await;
        let doc = svc
            .create("t1", Uuid::new_v4(), "notes", ContentType::Text, "agent-a")
            .await
            .unwrap();

        let op_id = Uuid::new_v4();
        let first = svc
            .apply_operation(
                "t1",
                doc.id,
                "agent-a",
                DocOpKind::Insert,
                insert_payload(0, "x"),
                Some(op_id),
                None,
            )
            .await
            .unwrap();
        let second = svc
            .apply_operation(
                "t1",
                doc.id,
                "agent-a",
                DocOpKind::Insert,
                insert_payload(0, "x"),
                Some(op_id),
                None,
            )
            .await
            .unwrap();
        assert_eq!(first.op_id, second.op_id);
        assert_eq!(first.sequence, second.sequence);
        assert_eq!(svc.materialized_content(doc.id).unwrap(), "x");
    }

    #[tokio::test]
    async fn test_lock_blocks_other_agents() {
        let svc = service().await;
        let doc = svc
            .create("t1", Uuid::new_v4(), "notes", ContentType::Text, "agent-a")
            .await
            .unwrap();

        svc.lock("t1", doc.id, "agent-a", Some(300)).await.unwrap();

        // Holder edits fine; others are rejected.
        svc.apply_operation(
            "t1",
            doc.id,
            "agent-a",
            DocOpKind::Insert,
            insert_payload(0, "a"),
            None,
            None,
        )
        .await
        .unwrap();
        let err = svc
            .apply_operation(
                "t1",
                doc.id,
                "agent-b",
                DocOpKind::Insert,
                insert_payload(0, "b"),
                None,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Conflict(_)));

        // Only the holder may unlock.
        let err = svc.unlock("t1", doc.id, "agent-b").await.unwrap_err();
        assert!(matches!(err, MeshError::Forbidden(_)));
        svc.unlock("t1", doc.id, "agent-a").await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_lock_released_lazily() {
        let svc = service().await;
        let doc = svc
            .create("t1", Uuid::new_v4(), "notes", ContentType::Text, "agent-a")
            .await
            .unwrap();

        // A lock that expired a second after creation.
        svc.lock("t1", doc.id, "agent-a", Some(-1)).await.unwrap();

        // Another agent's edit observes expiry and proceeds.
        svc.apply_operation(
            "t1",
            doc.id,
            "agent-b",
            DocOpKind::Insert,
            insert_payload(0, "b"),
            None,
            None,
        )
        .await
        .unwrap();
        assert_eq!(svc.materialized_content(doc.id).unwrap(), "b");
    }

    #[tokio::test]
    async fn test_operations_get_monotonic_sequence() {
        let svc = service().await;
        let doc = svc
            .create("t1", Uuid::new_v4(), "notes", ContentType::Text, "agent-a")
            .await
            .unwrap();

        for i in 0..3 {
            let op = svc
                .apply_operation(
                    "t1",
                    doc.id,
                    "agent-a",
                    DocOpKind::Insert,
                    insert_payload(i, "x"),
                    None,
                    None,
                )
                .await
                .unwrap();
            assert_eq!(op.sequence, i + 1);
        }

        let since = svc.operations_since("t1", doc.id, 1).await.unwrap();
        assert_eq!(since.len(), 2);
    }
}
