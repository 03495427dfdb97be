//! Positive-negative counter.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Counter operation attributed to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CounterOp {
    Increment { node_id: String, amount: u64 },
    Decrement { node_id: String, amount: u64 },
}

/// Grow-only positive and negative tallies per node. The value is the sum
/// of all increments minus the sum of all decrements; merge takes the
/// per-node maximum on each side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PnCounter {
    increments: BTreeMap<String, u64>,
    decrements: BTreeMap<String, u64>,
}

impl PnCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, op: CounterOp) {
        match op {
            CounterOp::Increment { node_id, amount } => {
                *self.increments.entry(node_id).or_insert(0) += amount;
            }
            CounterOp::Decrement { node_id, amount } => {
                *self.decrements.entry(node_id).or_insert(0) += amount;
            }
        }
    }

    pub fn increment(&mut self, node_id: &str, amount: u64) {
        self.apply(CounterOp::Increment {
            node_id: node_id.to_string(),
            amount,
        });
    }

    pub fn decrement(&mut self, node_id: &str, amount: u64) {
        self.apply(CounterOp::Decrement {
            node_id: node_id.to_string(),
            amount,
        });
    }

    pub fn value(&self) -> i64 {
        let pos: u64 = self.increments.values().sum();
        let neg: u64 = self.decrements.values().sum();
        pos as i64 - neg as i64
    }

    pub fn merge(&mut self, other: &PnCounter) {
        for (node, count) in &other.increments {
            let entry = self.increments.entry(node.clone()).or_insert(0);
            *entry = (*entry).max(*count);
        }
        for (node, count) in &other.decrements {
            let entry = self.decrements.entry(node.clone()).or_insert(0);
            *entry = (*entry).max(*count);
        }
    }
}
