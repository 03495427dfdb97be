//! Aggregation of subtask results into a distributed parent's result.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};

use mesh_core::error::{MeshError, Result};
use mesh_core::models::{AggregationPolicy, Fields};

/// Marker field added to the parent result when some subtasks failed but
/// the failure policy allowed completion.
pub const PARTIAL_FAILURE_FIELD: &str = "_partial_failure";

/// A named reducer for [`AggregationPolicy::Custom`]. Receives the
/// successful results in declaration order, whether the set is partial,
/// and the ids of the failed subtasks.
pub type CustomReducer =
    Arc<dyn Fn(&[(String, Fields)], bool, &[String]) -> Fields + Send + Sync>;

/// Registry of custom reducers, shared by the task engine.
#[derive(Clone, Default)]
pub struct ReducerRegistry {
    reducers: HashMap<String, CustomReducer>,
}

impl ReducerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, reducer: CustomReducer) {
        self.reducers.insert(name.into(), reducer);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.reducers.contains_key(name)
    }

    fn get(&self, name: &str) -> Option<&CustomReducer> {
        self.reducers.get(name)
    }
}

/// Fold `successes` into one result map under `policy`.
///
/// When `failed` is non-empty the output carries a partial-failure marker
/// listing the failed subtask ids. Custom reducers see only the successes
/// plus the partial flag; the wait policy alone decides completion.
pub fn aggregate(
    policy: &AggregationPolicy,
    registry: &ReducerRegistry,
    successes: &[(String, Fields)],
    failed: &[String],
) -> Result<Fields> {
    let mut result = match policy {
        AggregationPolicy::Combine => combine(successes),
        AggregationPolicy::Sum => numeric_fold(successes, false),
        AggregationPolicy::Average => numeric_fold(successes, true),
        AggregationPolicy::MapReduce => map_reduce(successes),
        AggregationPolicy::Custom(name) => {
            let reducer = registry.get(name).ok_or_else(|| {
                MeshError::InvalidParams(format!("unknown custom aggregator '{name}'"))
            })?;
            reducer(successes, !failed.is_empty(), failed)
        }
    };

    if !failed.is_empty() {
        result.insert(PARTIAL_FAILURE_FIELD.to_string(), json!(failed));
    }
    Ok(result)
}

/// Shallow merge in declaration order; later subtasks win on key clashes.
fn combine(successes: &[(String, Fields)]) -> Fields {
    let mut out = Fields::new();
    for (_, fields) in successes {
        for (key, value) in fields {
            out.insert(key.clone(), value.clone());
        }
    }
    out
}

/// Per-key sum, or mean when `average` is set. Non-numeric values are
/// ignored.
fn numeric_fold(successes: &[(String, Fields)], average: bool) -> Fields {
    let mut sums: HashMap<String, (f64, u64)> = HashMap::new();
    for (_, fields) in successes {
        for (key, value) in fields {
            if let Some(n) = value.as_f64() {
                let entry = sums.entry(key.clone()).or_insert((0.0, 0));
                entry.0 += n;
                entry.1 += 1;
            }
        }
    }

    let mut out = Fields::new();
    let mut keys: Vec<&String> = sums.keys().collect();
    keys.sort();
    for key in keys {
        let (sum, count) = sums[key];
        let value = if average && count > 0 {
            sum / count as f64
        } else {
            sum
        };
        if let Some(n) = serde_json::Number::from_f64(value) {
            out.insert(key.clone(), Value::Number(n));
        }
    }
    out
}

/// Each subtask's result keyed by its id.
fn map_reduce(successes: &[(String, Fields)]) -> Fields {
    let mut out = Fields::new();
    for (subtask_id, fields) in successes {
        out.insert(subtask_id.clone(), Value::Object(fields.clone()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, Value)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_combine_merges_maps() {
        let successes = vec![
            ("s1".to_string(), fields(&[("x", json!(1))])),
            ("s2".to_string(), fields(&[("y", json!(2))])),
        ];
        let result = aggregate(
            &AggregationPolicy::Combine,
            &ReducerRegistry::new(),
            &successes,
            &[],
        )
        .unwrap();
        assert_eq!(result["x"], 1);
        assert_eq!(result["y"], 2);
        assert!(!result.contains_key(PARTIAL_FAILURE_FIELD));
    }

    #[test]
    fn test_partial_failure_marker() {
        let successes = vec![
            ("s1".to_string(), fields(&[("x", json!(1))])),
            ("s2".to_string(), fields(&[("y", json!(2))])),
        ];
        let failed = vec!["s3".to_string()];
        let result = aggregate(
            &AggregationPolicy::Combine,
            &ReducerRegistry::new(),
            &successes,
            &failed,
        )
        .unwrap();
        assert_eq!(result["x"], 1);
        assert_eq!(result["y"], 2);
        assert_eq!(result[PARTIAL_FAILURE_FIELD], json!(["s3"]));
    }

    #[test]
    fn test_sum_and_average() {
        let successes = vec![
            ("s1".to_string(), fields(&[("n", json!(4.0))])),
            ("s2".to_string(), fields(&[("n", json!(8.0))])),
        ];
        let sum = aggregate(
            &AggregationPolicy::Sum,
            &ReducerRegistry::new(),
            &successes,
            &[],
        )
        .unwrap();
        assert_eq!(sum["n"], 12.0);

        let avg = aggregate(
            &AggregationPolicy::Average,
            &ReducerRegistry::new(),
            &successes,
            &[],
        )
        .unwrap();
        assert_eq!(avg["n"], 6.0);
    }

    #[test]
    fn test_map_reduce_keys_by_subtask() {
        let successes = vec![("s1".to_string(), fields(&[("v", json!(1))]))];
        let result = aggregate(
            &AggregationPolicy::MapReduce,
            &ReducerRegistry::new(),
            &successes,
            &[],
        )
        .unwrap();
        assert_eq!(result["s1"]["v"], 1);
    }

    #[test]
    fn test_custom_reducer_sees_partial_flag() {
        let mut registry = ReducerRegistry::new();
        registry.register(
            "count",
            Arc::new(|successes, partial, failed| {
                fields(&[
                    ("succeeded", json!(successes.len())),
                    ("partial", json!(partial)),
                    ("failed_count", json!(failed.len())),
                ])
            }),
        );

        let successes = vec![("s1".to_string(), Fields::new())];
        let result = aggregate(
            &AggregationPolicy::Custom("count".into()),
            &registry,
            &successes,
            &["s2".to_string()],
        )
        .unwrap();
        assert_eq!(result["succeeded"], 1);
        assert_eq!(result["partial"], true);
        assert_eq!(result["failed_count"], 1);
    }

    #[test]
    fn test_unknown_custom_reducer() {
        let err = aggregate(
            &AggregationPolicy::Custom("ghost".into()),
            &ReducerRegistry::new(),
            &[],
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, MeshError::InvalidParams(_)));
    }
}
