//! Replicated growable array for ordered sequences.
//!
//! Elements live in a doubly-linked structure rooted at a sentinel and are
//! addressed by globally unique ids. Concurrent inserts after the same
//! predecessor are ordered newest-first by timestamp, which gives every
//! replica the same final order. Deletes leave tombstones until garbage
//! collection.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::HlcTimestamp;

/// Globally unique element id: the stamping timestamp (which embeds the
/// node id) plus a uuid for uniqueness within a single clock tick.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementId {
    pub ts: HlcTimestamp,
    pub uuid: Uuid,
}

impl ElementId {
    pub fn new(ts: HlcTimestamp) -> Self {
        Self {
            ts,
            uuid: Uuid::new_v4(),
        }
    }
}

impl Ord for ElementId {
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.ts, self.uuid).cmp(&(&other.ts, other.uuid))
    }
}

impl PartialOrd for ElementId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Sequence operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RgaOp {
    /// Insert `value` after element `after`, or at the head when `after`
    /// is `None`.
    Insert {
        id: ElementId,
        after: Option<ElementId>,
        value: String,
    },
    /// Tombstone the element with id `target`.
    Delete { target: ElementId },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Node {
    value: String,
    prev: Option<ElementId>,
    next: Option<ElementId>,
    tombstone: bool,
}

/// The RGA sequence itself.
///
/// `apply` is idempotent: an insert whose id is already indexed and a
/// delete of an already-tombstoned element are both no-ops. Inserts whose
/// predecessor has not arrived yet are buffered and retried on each
/// subsequent apply.
///
/// Serializes as its operation history; a deserialized replica replays the
/// history and converges on the same state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "RgaWire", into = "RgaWire")]
pub struct Rga {
    nodes: HashMap<ElementId, Node>,
    head: Option<ElementId>,
    pending: Vec<RgaOp>,
    history: Vec<RgaOp>,
}

#[derive(Serialize, Deserialize)]
struct RgaWire {
    history: Vec<RgaOp>,
    #[serde(default)]
    pending: Vec<RgaOp>,
}

impl From<RgaWire> for Rga {
    fn from(wire: RgaWire) -> Self {
        let mut rga = Rga::new();
        for op in wire.history.into_iter().chain(wire.pending) {
            rga.apply(op);
        }
        rga
    }
}

impl From<Rga> for RgaWire {
    fn from(rga: Rga) -> Self {
        Self {
            history: rga.history,
            pending: rga.pending,
        }
    }
}

impl Rga {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one operation, then retry any buffered operations that may
    /// have become applicable.
    pub fn apply(&mut self, op: RgaOp) {
        self.apply_one(op);
        self.drain_pending();
    }

    fn apply_one(&mut self, op: RgaOp) {
        match op {
            RgaOp::Insert { id, after, value } => {
                if self.nodes.contains_key(&id) {
                    return;
                }
                if let Some(pred) = &after {
                    if !self.nodes.contains_key(pred) {
                        self.pending.push(RgaOp::Insert { id, after, value });
                        return;
                    }
                }
                self.link(id.clone(), after.clone(), value.clone());
                self.history.push(RgaOp::Insert { id, after, value });
            }
            RgaOp::Delete { target } => {
                match self.nodes.get_mut(&target) {
                    Some(node) if !node.tombstone => {
                        node.tombstone = true;
                        self.history.push(RgaOp::Delete { target });
                    }
                    Some(_) => {}
                    None => self.pending.push(RgaOp::Delete { target }),
                }
            }
        }
    }

    fn drain_pending(&mut self) {
        // Each pass may unblock operations buffered earlier; loop until a
        // full pass applies nothing.
        loop {
            if self.pending.is_empty() {
                return;
            }
            let before = self.pending.len();
            let retry = std::mem::take(&mut self.pending);
            for op in retry {
                self.apply_one(op);
            }
            if self.pending.len() >= before {
                return;
            }
        }
    }

    /// Link a new element after `after`, skipping over concurrent siblings
    /// with greater ids so all replicas order them identically.
    fn link(&mut self, id: ElementId, after: Option<ElementId>, value: String) {
        let mut cursor = match &after {
            Some(pred) => self.nodes[pred].next.clone(),
            None => self.head.clone(),
        };
        let mut prev = after;

        while let Some(next_id) = cursor {
            if next_id > id {
                prev = Some(next_id.clone());
                cursor = self.nodes[&next_id].next.clone();
            } else {
                cursor = Some(next_id);
                break;
            }
        }

        let node = Node {
            value,
            prev: prev.clone(),
            next: cursor.clone(),
            tombstone: false,
        };

        match &prev {
            Some(p) => {
                if let Some(pnode) = self.nodes.get_mut(p) {
                    pnode.next = Some(id.clone());
                }
            }
            None => self.head = Some(id.clone()),
        }
        if let Some(n) = &cursor {
            if let Some(nnode) = self.nodes.get_mut(n) {
                nnode.prev = Some(id.clone());
            }
        }
        self.nodes.insert(id, node);
    }

    /// Visible content, tombstones excluded.
    pub fn content(&self) -> String {
        let mut out = String::new();
        let mut cursor = self.head.clone();
        while let Some(id) = cursor {
            let node = &self.nodes[&id];
            if !node.tombstone {
                out.push_str(&node.value);
            }
            cursor = node.next.clone();
        }
        out
    }

    /// Visible element ids in order.
    pub fn visible_ids(&self) -> Vec<ElementId> {
        let mut out = Vec::new();
        let mut cursor = self.head.clone();
        while let Some(id) = cursor {
            let node = &self.nodes[&id];
            if !node.tombstone {
                out.push(id.clone());
            }
            cursor = node.next.clone();
        }
        out
    }

    /// Id of the visible element at `index`, if any.
    pub fn id_at(&self, index: usize) -> Option<ElementId> {
        self.visible_ids().into_iter().nth(index)
    }

    /// Every applied operation, suitable for shipping to a fresh replica.
    pub fn history(&self) -> &[RgaOp] {
        &self.history
    }

    /// Number of operations waiting for a missing predecessor.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn len(&self) -> usize {
        self.visible_ids().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merge another replica by replaying its history.
    pub fn merge(&mut self, other: &Rga) {
        for op in other.history.iter().chain(other.pending.iter()) {
            self.apply(op.clone());
        }
    }

    /// Drop tombstoned nodes stamped before `before`. Pending operations
    /// that still reference a collected node will never apply, so they are
    /// dropped alongside.
    pub fn gc(&mut self, before: &HlcTimestamp) -> usize {
        let doomed: Vec<ElementId> = self
            .nodes
            .iter()
            .filter(|(id, node)| node.tombstone && id.ts < *before)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &doomed {
            let node = match self.nodes.remove(id) {
                Some(n) => n,
                None => continue,
            };
            match &node.prev {
                Some(p) => {
                    if let Some(pnode) = self.nodes.get_mut(p) {
                        pnode.next = node.next.clone();
                    }
                }
                None => self.head = node.next.clone(),
            }
            if let Some(n) = &node.next {
                if let Some(nnode) = self.nodes.get_mut(n) {
                    nnode.prev = node.prev.clone();
                }
            }
        }

        let collected: std::collections::HashSet<&ElementId> = doomed.iter().collect();
        self.pending.retain(|op| match op {
            RgaOp::Insert { after: Some(p), .. } => !collected.contains(p),
            RgaOp::Delete { target } => !collected.contains(target),
            _ => true,
        });
        doomed.len()
    }
}
