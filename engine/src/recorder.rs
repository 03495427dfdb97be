//! Audit recording around repository writes.

use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use mesh_core::audit::{AuditAction, AuditRecord};
use mesh_core::repository::AuditRepository;

/// Records entity transitions. Failures are logged, never propagated; the
/// primary write has already happened.
#[derive(Clone)]
pub struct AuditRecorder {
    repo: Arc<dyn AuditRepository>,
}

impl AuditRecorder {
    pub fn new(repo: Arc<dyn AuditRepository>) -> Self {
        Self { repo }
    }

    pub async fn insert<T: Serialize>(
        &self,
        tenant_id: &str,
        entity_kind: &str,
        record_id: impl std::fmt::Display,
        new: &T,
        principal: &str,
    ) {
        self.write(
            tenant_id,
            entity_kind,
            record_id,
            AuditAction::Insert,
            None,
            serde_json::to_value(new).ok(),
            principal,
        )
        .await;
    }

    pub async fn update<T: Serialize>(
        &self,
        tenant_id: &str,
        entity_kind: &str,
        record_id: impl std::fmt::Display,
        old: &T,
        new: &T,
        principal: &str,
    ) {
        self.write(
            tenant_id,
            entity_kind,
            record_id,
            AuditAction::Update,
            serde_json::to_value(old).ok(),
            serde_json::to_value(new).ok(),
            principal,
        )
        .await;
    }

    pub async fn delete<T: Serialize>(
        &self,
        tenant_id: &str,
        entity_kind: &str,
        record_id: impl std::fmt::Display,
        old: &T,
        principal: &str,
    ) {
        self.write(
            tenant_id,
            entity_kind,
            record_id,
            AuditAction::Delete,
            serde_json::to_value(old).ok(),
            None,
            principal,
        )
        .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn write(
        &self,
        tenant_id: &str,
        entity_kind: &str,
        record_id: impl std::fmt::Display,
        action: AuditAction,
        old: Option<serde_json::Value>,
        new: Option<serde_json::Value>,
        principal: &str,
    ) {
        let record = AuditRecord::new(tenant_id, entity_kind, record_id, action, old, new, principal);
        if let Err(err) = self.repo.record(record).await {
            warn!(%err, entity_kind, "audit record failed");
        }
    }
}
