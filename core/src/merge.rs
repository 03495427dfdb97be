//! Strategy-dispatched conflict resolution.
//!
//! Given a `(base, ours, theirs)` triple the engine picks one of a closed
//! set of strategies, deterministically for the same inputs and context.
//! Ambiguous fields are replaced with a conflict marker object rather than
//! silently dropping either side.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::clock::HlcTimestamp;
use crate::crdt::Crdt;
use crate::error::{MeshError, Result};

/// The strategy the engine settled on for a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Domain-aware field reconciliation
    Semantic,
    /// Per-field three-way merge for map-shaped values
    ThreeWay,
    /// Delegate to the CRDT merge, never conflicts
    Crdt,
    /// Newest timestamp wins
    LastWriteWins,
}

/// Inputs that steer strategy selection.
#[derive(Debug, Clone)]
pub struct MergeContext {
    /// Declared content domain, enables the semantic strategy
    pub domain: Option<String>,
    /// Values are serialized CRDT state
    pub crdt_backed: bool,
    /// Timestamp of our side
    pub ours_ts: HlcTimestamp,
    /// Timestamp of their side
    pub theirs_ts: HlcTimestamp,
    /// Force a specific strategy instead of the default priority order
    pub forced: Option<MergeStrategy>,
}

impl MergeContext {
    pub fn new(ours_ts: HlcTimestamp, theirs_ts: HlcTimestamp) -> Self {
        Self {
            domain: None,
            crdt_backed: false,
            ours_ts,
            theirs_ts,
            forced: None,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn crdt_backed(mut self) -> Self {
        self.crdt_backed = true;
        self
    }
}

/// Merge outcome: the merged value, the strategy used, and the dotted paths
/// of any fields replaced by conflict markers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeResult {
    pub value: Value,
    pub strategy: MergeStrategy,
    pub conflicts: Vec<String>,
}

impl MergeResult {
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// Build the marker object left in place of an irreconcilable field.
fn conflict_marker(base: &Value, ours: &Value, theirs: &Value) -> Value {
    json!({
        "_conflict": true,
        "ours": ours,
        "theirs": theirs,
        "base": base,
    })
}

/// The engine. Stateless; selection depends only on the inputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeEngine;

impl MergeEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn merge(
        &self,
        base: &Value,
        ours: &Value,
        theirs: &Value,
        ctx: &MergeContext,
    ) -> Result<MergeResult> {
        if let Some(forced) = ctx.forced {
            return self.run(forced, base, ours, theirs, ctx);
        }

        if let Some(domain) = &ctx.domain {
            if is_known_domain(domain) {
                return self.run(MergeStrategy::Semantic, base, ours, theirs, ctx);
            }
        }
        if ctx.crdt_backed {
            return self.run(MergeStrategy::Crdt, base, ours, theirs, ctx);
        }
        if base.is_object() && ours.is_object() && theirs.is_object() {
            return self.run(MergeStrategy::ThreeWay, base, ours, theirs, ctx);
        }
        self.run(MergeStrategy::LastWriteWins, base, ours, theirs, ctx)
    }

    fn run(
        &self,
        strategy: MergeStrategy,
        base: &Value,
        ours: &Value,
        theirs: &Value,
        ctx: &MergeContext,
    ) -> Result<MergeResult> {
        match strategy {
            MergeStrategy::Semantic => self.semantic(base, ours, theirs, ctx),
            MergeStrategy::ThreeWay => Ok(self.three_way(base, ours, theirs)),
            MergeStrategy::Crdt => self.crdt(ours, theirs),
            MergeStrategy::LastWriteWins => Ok(self.last_write_wins(ours, theirs, ctx)),
        }
    }

    /// Domain-aware reconciliation. Numeric counter maps combine both
    /// sides' deltas against base; tag sets take the union. A field the
    /// rules cannot reconcile becomes a semantic conflict.
    fn semantic(
        &self,
        base: &Value,
        ours: &Value,
        theirs: &Value,
        ctx: &MergeContext,
    ) -> Result<MergeResult> {
        let domain = ctx.domain.as_deref().unwrap_or("");
        let (base_map, ours_map, theirs_map) = match (base, ours, theirs) {
            (Value::Object(b), Value::Object(o), Value::Object(t)) => (b, o, t),
            _ => {
                return Err(MeshError::Validation(format!(
                    "semantic domain '{domain}' requires map-shaped values"
                )))
            }
        };

        let mut merged = Map::new();
        let mut conflicts = Vec::new();
        let keys: std::collections::BTreeSet<&String> = base_map
            .keys()
            .chain(ours_map.keys())
            .chain(theirs_map.keys())
            .collect();

        for key in keys {
            let b = base_map.get(key).cloned().unwrap_or(Value::Null);
            let o = ours_map.get(key).cloned().unwrap_or(Value::Null);
            let t = theirs_map.get(key).cloned().unwrap_or(Value::Null);

            let resolved = match domain {
                "counter_map" => merge_counters(&b, &o, &t),
                "tag_set" => merge_tag_sets(&o, &t),
                _ => None,
            };

            match resolved {
                Some(value) => {
                    merged.insert(key.clone(), value);
                }
                None if o == t => {
                    merged.insert(key.clone(), o);
                }
                None if o == b => {
                    merged.insert(key.clone(), t);
                }
                None if t == b => {
                    merged.insert(key.clone(), o);
                }
                None => {
                    conflicts.push(key.clone());
                    merged.insert(key.clone(), conflict_marker(&b, &o, &t));
                }
            }
        }

        Ok(MergeResult {
            value: Value::Object(merged),
            strategy: MergeStrategy::Semantic,
            conflicts,
        })
    }

    /// Per-key three-way merge over the union of keys.
    fn three_way(&self, base: &Value, ours: &Value, theirs: &Value) -> MergeResult {
        let empty = Map::new();
        let base_map = base.as_object().unwrap_or(&empty);
        let ours_map = ours.as_object().unwrap_or(&empty);
        let theirs_map = theirs.as_object().unwrap_or(&empty);

        let mut merged = Map::new();
        let mut conflicts = Vec::new();
        let keys: std::collections::BTreeSet<&String> = base_map
            .keys()
            .chain(ours_map.keys())
            .chain(theirs_map.keys())
            .collect();

        for key in keys {
            let b = base_map.get(key).cloned().unwrap_or(Value::Null);
            let o = ours_map.get(key).cloned().unwrap_or(Value::Null);
            let t = theirs_map.get(key).cloned().unwrap_or(Value::Null);

            if o == t {
                insert_unless_null(&mut merged, key, o);
            } else if o == b {
                insert_unless_null(&mut merged, key, t);
            } else if t == b {
                insert_unless_null(&mut merged, key, o);
            } else {
                conflicts.push(key.clone());
                merged.insert(key.clone(), conflict_marker(&b, &o, &t));
            }
        }

        MergeResult {
            value: Value::Object(merged),
            strategy: MergeStrategy::ThreeWay,
            conflicts,
        }
    }

    /// Deserialize both sides as CRDT state and merge; convergent, so no
    /// conflicts are possible.
    fn crdt(&self, ours: &Value, theirs: &Value) -> Result<MergeResult> {
        let mut ours_state: Crdt = serde_json::from_value(ours.clone())
            .map_err(|e| MeshError::Validation(format!("not CRDT state: {e}")))?;
        let theirs_state: Crdt = serde_json::from_value(theirs.clone())
            .map_err(|e| MeshError::Validation(format!("not CRDT state: {e}")))?;
        ours_state.merge(&theirs_state)?;
        let value = serde_json::to_value(&ours_state)
            .map_err(|e| MeshError::Internal(format!("CRDT serialization failed: {e}")))?;
        Ok(MergeResult {
            value,
            strategy: MergeStrategy::Crdt,
            conflicts: Vec::new(),
        })
    }

    fn last_write_wins(&self, ours: &Value, theirs: &Value, ctx: &MergeContext) -> MergeResult {
        let value = if ctx.ours_ts >= ctx.theirs_ts {
            ours.clone()
        } else {
            theirs.clone()
        };
        MergeResult {
            value,
            strategy: MergeStrategy::LastWriteWins,
            conflicts: Vec::new(),
        }
    }
}

fn is_known_domain(domain: &str) -> bool {
    matches!(domain, "counter_map" | "tag_set")
}

/// Numeric fields merge as base plus both deltas. Non-numeric fields fall
/// back to the caller's per-key resolution.
fn merge_counters(base: &Value, ours: &Value, theirs: &Value) -> Option<Value> {
    let b = base.as_f64().unwrap_or(0.0);
    let o = ours.as_f64()?;
    let t = theirs.as_f64()?;
    let merged = b + (o - b) + (t - b);
    serde_json::Number::from_f64(merged).map(Value::Number)
}

/// Array fields merge as a sorted union of both sides.
fn merge_tag_sets(ours: &Value, theirs: &Value) -> Option<Value> {
    let o = ours.as_array()?;
    let t = theirs.as_array()?;
    let mut tags: Vec<String> = o
        .iter()
        .chain(t.iter())
        .filter_map(|v| v.as_str().map(String::from))
        .collect();
    tags.sort();
    tags.dedup();
    Some(json!(tags))
}

fn insert_unless_null(map: &mut Map<String, Value>, key: &str, value: Value) {
    if !value.is_null() {
        map.insert(key.to_string(), value);
    }
}
