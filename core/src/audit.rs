//! Tamper-evident audit records for state transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// What happened to the record.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Insert,
    Update,
    Delete,
}

/// One audit entry. Entries are append-only and keyed by time so the
/// store can partition them for retention.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    pub id: Uuid,
    pub tenant_id: String,
    /// Entity kind, e.g. `task` or `workspace`
    pub entity_kind: String,
    pub record_id: String,
    pub action: AuditAction,
    pub old_image: Option<Value>,
    pub new_image: Option<Value>,
    /// Top-level fields that differ between the images
    pub changed_fields: Vec<String>,
    /// Agent or system principal that caused the change
    pub principal: String,
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        tenant_id: impl Into<String>,
        entity_kind: impl Into<String>,
        record_id: impl std::fmt::Display,
        action: AuditAction,
        old_image: Option<Value>,
        new_image: Option<Value>,
        principal: impl Into<String>,
    ) -> Self {
        let changed_fields = changed_fields(old_image.as_ref(), new_image.as_ref());
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            entity_kind: entity_kind.into(),
            record_id: record_id.to_string(),
            action,
            old_image,
            new_image,
            changed_fields,
            principal: principal.into(),
            recorded_at: Utc::now(),
        }
    }
}

/// Top-level keys whose values differ between the two images.
pub fn changed_fields(old: Option<&Value>, new: Option<&Value>) -> Vec<String> {
    let empty = serde_json::Map::new();
    let old_map = old.and_then(|v| v.as_object()).unwrap_or(&empty);
    let new_map = new.and_then(|v| v.as_object()).unwrap_or(&empty);

    let mut fields: Vec<String> = old_map
        .keys()
        .chain(new_map.keys())
        .filter(|k| old_map.get(*k) != new_map.get(*k))
        .cloned()
        .collect();
    fields.sort();
    fields.dedup();
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_changed_fields_diff() {
        let old = json!({"status": "pending", "version": 1, "name": "t"});
        let new = json!({"status": "assigned", "version": 2, "name": "t"});
        assert_eq!(
            changed_fields(Some(&old), Some(&new)),
            vec!["status", "version"]
        );
    }

    #[test]
    fn test_insert_has_all_new_fields_changed() {
        let new = json!({"a": 1, "b": 2});
        assert_eq!(changed_fields(None, Some(&new)), vec!["a", "b"]);
    }

    #[test]
    fn test_record_computes_diff() {
        let record = AuditRecord::new(
            "t1",
            "task",
            "task-1",
            AuditAction::Update,
            Some(json!({"status": "pending"})),
            Some(json!({"status": "assigned"})),
            "agent-a",
        );
        assert_eq!(record.changed_fields, vec!["status"]);
        assert_eq!(record.action, AuditAction::Update);
    }
}
