//! Hybrid logical clocks and vector clocks.
//!
//! Every state mutation in the mesh is stamped with a hybrid logical
//! timestamp so that replicas agree on a total order that respects both
//! wall-clock time and causality. Vector clocks are carried alongside
//! document operations to detect concurrency.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{MeshError, Result};

/// A hybrid logical timestamp: wall-clock nanoseconds, a logical counter
/// for events inside the same nanosecond, and the issuing node id as the
/// final tie-break.
///
/// Ordering is lexicographic on `(physical, logical, node_id)`, which is a
/// total order across all nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HlcTimestamp {
    /// Wall-clock component in nanoseconds since the Unix epoch
    pub physical: i64,
    /// Logical counter disambiguating events with equal physical time
    pub logical: u32,
    /// Issuing node id, last tie-break in the total order
    pub node_id: String,
}

impl HlcTimestamp {
    pub fn new(physical: i64, logical: u32, node_id: impl Into<String>) -> Self {
        Self {
            physical,
            logical,
            node_id: node_id.into(),
        }
    }

    /// Zero timestamp, ordered before any real event
    pub fn zero(node_id: impl Into<String>) -> Self {
        Self::new(0, 0, node_id)
    }

    /// True when `self` happens before `other` in the causal prefix order
    /// on `(physical, logical)`. Two timestamps with equal prefix but
    /// different nodes are not causally related.
    pub fn happens_before(&self, other: &HlcTimestamp) -> bool {
        (self.physical, self.logical) < (other.physical, other.logical)
    }

    /// Compact string form, `physical:logical:node_id`
    pub fn encode(&self) -> String {
        format!("{}:{}:{}", self.physical, self.logical, self.node_id)
    }

    /// Parse the string form produced by [`HlcTimestamp::encode`]
    pub fn decode(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, ':');
        let physical = parts
            .next()
            .and_then(|p| p.parse::<i64>().ok())
            .ok_or_else(|| MeshError::InvalidParams(format!("bad HLC timestamp '{s}'")))?;
        let logical = parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .ok_or_else(|| MeshError::InvalidParams(format!("bad HLC timestamp '{s}'")))?;
        let node_id = parts
            .next()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| MeshError::InvalidParams(format!("bad HLC timestamp '{s}'")))?;
        Ok(Self::new(physical, logical, node_id))
    }
}

impl Ord for HlcTimestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.physical, self.logical, &self.node_id).cmp(&(
            other.physical,
            other.logical,
            &other.node_id,
        ))
    }
}

impl PartialOrd for HlcTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for HlcTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Per-node hybrid logical clock.
///
/// `now()` is strictly monotonic for a single clock instance. `update()`
/// folds in a remote timestamp and rejects peers whose physical component
/// runs ahead of local wall-clock by more than the configured drift bound;
/// a rejected update puts the clock into a degraded read-only flag that
/// clears on the next in-bound sync.
#[derive(Debug)]
pub struct HybridLogicalClock {
    node_id: String,
    max_drift_ms: i64,
    state: Mutex<(i64, u32)>,
    degraded: AtomicBool,
}

impl HybridLogicalClock {
    /// Default drift bound between cooperating nodes
    pub const DEFAULT_MAX_DRIFT_MS: i64 = 10_000;

    pub fn new(node_id: impl Into<String>, max_drift_ms: i64) -> Self {
        Self {
            node_id: node_id.into(),
            max_drift_ms,
            state: Mutex::new((0, 0)),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn with_default_drift(node_id: impl Into<String>) -> Self {
        Self::new(node_id, Self::DEFAULT_MAX_DRIFT_MS)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Whether a drift rejection has put this node into degraded mode
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(AtomicOrdering::SeqCst)
    }

    fn physical_now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0)
    }

    /// Produce the next local timestamp. Strictly greater than every
    /// timestamp previously returned by this clock.
    pub fn now(&self) -> HlcTimestamp {
        let physical_now = Self::physical_now();
        let mut state = self.state.lock();
        if physical_now > state.0 {
            *state = (physical_now, 0);
        } else {
            state.1 += 1;
        }
        HlcTimestamp::new(state.0, state.1, self.node_id.clone())
    }

    /// Fold a remote timestamp into the local clock and return the merged
    /// local timestamp.
    ///
    /// Fails with [`MeshError::ClockDrift`] when the remote physical
    /// component is ahead of local wall-clock by more than the drift bound.
    pub fn update(&self, remote: &HlcTimestamp) -> Result<HlcTimestamp> {
        let physical_now = Self::physical_now();
        let drift_ms = (remote.physical - physical_now) / 1_000_000;
        if drift_ms > self.max_drift_ms {
            self.degraded.store(true, AtomicOrdering::SeqCst);
            return Err(MeshError::ClockDrift {
                drift_ms,
                max_drift_ms: self.max_drift_ms,
            });
        }

        let mut state = self.state.lock();
        let (pt, lt) = *state;
        let max_pt = physical_now.max(pt).max(remote.physical);
        let new_lt = if max_pt == pt && max_pt == remote.physical {
            lt.max(remote.logical) + 1
        } else if max_pt == pt {
            lt + 1
        } else if max_pt == remote.physical {
            remote.logical + 1
        } else {
            0
        };
        *state = (max_pt, new_lt);
        // A successful in-bound sync clears the degraded flag.
        self.degraded.store(false, AtomicOrdering::SeqCst);
        Ok(HlcTimestamp::new(max_pt, new_lt, self.node_id.clone()))
    }
}

/// Outcome of comparing two vector clocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CausalOrder {
    /// Left strictly precedes right
    Before,
    /// Left strictly follows right
    After,
    /// Identical clocks
    Equal,
    /// Neither dominates the other
    Concurrent,
}

/// Map from node id to the count of events observed from that node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    entries: BTreeMap<String, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, node_id: &str) -> u64 {
        self.entries.get(node_id).copied().unwrap_or(0)
    }

    /// Record one more local event for `node_id`
    pub fn increment(&mut self, node_id: &str) {
        *self.entries.entry(node_id.to_string()).or_insert(0) += 1;
    }

    /// Component-wise maximum with another clock
    pub fn merge(&mut self, other: &VectorClock) {
        for (node, count) in &other.entries {
            let entry = self.entries.entry(node.clone()).or_insert(0);
            *entry = (*entry).max(*count);
        }
    }

    pub fn compare(&self, other: &VectorClock) -> CausalOrder {
        let mut less = false;
        let mut greater = false;
        let nodes: std::collections::BTreeSet<&String> =
            self.entries.keys().chain(other.entries.keys()).collect();
        for node in nodes {
            let a = self.get(node);
            let b = other.get(node);
            if a < b {
                less = true;
            } else if a > b {
                greater = true;
            }
        }
        match (less, greater) {
            (false, false) => CausalOrder::Equal,
            (true, false) => CausalOrder::Before,
            (false, true) => CausalOrder::After,
            (true, true) => CausalOrder::Concurrent,
        }
    }
}
