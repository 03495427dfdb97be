//! Last-write-wins element set.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::clock::HlcTimestamp;

/// Add or remove an element at a timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LwwOp {
    Add { element: String, ts: HlcTimestamp },
    Remove { element: String, ts: HlcTimestamp },
}

/// Set where the newest timestamp wins per element. An element is a member
/// when it has an add entry that is newer than any remove entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LwwSet {
    adds: HashMap<String, HlcTimestamp>,
    removes: HashMap<String, HlcTimestamp>,
}

impl LwwSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, op: LwwOp) {
        match op {
            LwwOp::Add { element, ts } => Self::keep_newest(&mut self.adds, element, ts),
            LwwOp::Remove { element, ts } => Self::keep_newest(&mut self.removes, element, ts),
        }
    }

    fn keep_newest(map: &mut HashMap<String, HlcTimestamp>, element: String, ts: HlcTimestamp) {
        match map.get(&element) {
            Some(existing) if *existing >= ts => {}
            _ => {
                map.insert(element, ts);
            }
        }
    }

    pub fn add(&mut self, element: impl Into<String>, ts: HlcTimestamp) {
        self.apply(LwwOp::Add {
            element: element.into(),
            ts,
        });
    }

    pub fn remove(&mut self, element: impl Into<String>, ts: HlcTimestamp) {
        self.apply(LwwOp::Remove {
            element: element.into(),
            ts,
        });
    }

    pub fn contains(&self, element: &str) -> bool {
        match (self.adds.get(element), self.removes.get(element)) {
            (Some(added), Some(removed)) => added > removed,
            (Some(_), None) => true,
            _ => false,
        }
    }

    /// Current members in sorted order.
    pub fn elements(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .adds
            .keys()
            .filter(|e| self.contains(e))
            .cloned()
            .collect();
        out.sort();
        out
    }

    pub fn len(&self) -> usize {
        self.adds.keys().filter(|e| self.contains(e)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keep the newest timestamp on both sides per element.
    pub fn merge(&mut self, other: &LwwSet) {
        for (element, ts) in &other.adds {
            Self::keep_newest(&mut self.adds, element.clone(), ts.clone());
        }
        for (element, ts) in &other.removes {
            Self::keep_newest(&mut self.removes, element.clone(), ts.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::HybridLogicalClock;
    use proptest::prelude::*;

    #[test]
    fn test_add_then_remove() {
        let clock = HybridLogicalClock::with_default_drift("n1");
        let mut set = LwwSet::new();
        set.add("x", clock.now());
        assert!(set.contains("x"));
        set.remove("x", clock.now());
        assert!(!set.contains("x"));
        set.add("x", clock.now());
        assert!(set.contains("x"));
    }

    #[test]
    fn test_stale_remove_loses() {
        let clock = HybridLogicalClock::with_default_drift("n1");
        let old = clock.now();
        let new = clock.now();
        let mut set = LwwSet::new();
        set.add("x", new);
        set.remove("x", old);
        assert!(set.contains("x"));
    }

    #[test]
    fn test_merge_converges() {
        let c1 = HybridLogicalClock::with_default_drift("n1");
        let c2 = HybridLogicalClock::with_default_drift("n2");

        let mut a = LwwSet::new();
        let mut b = LwwSet::new();
        a.add("shared", c1.now());
        b.remove("shared", c2.now());
        a.add("only-a", c1.now());
        b.add("only-b", c2.now());

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);
        assert_eq!(ab, ba);
        assert!(ab.contains("only-a"));
        assert!(ab.contains("only-b"));
    }

    proptest! {
        #[test]
        fn prop_apply_order_is_irrelevant(seed in 0u64..1000) {
            // Build a fixed op set, apply in two different orders.
            let clock = HybridLogicalClock::with_default_drift("n1");
            let mut ops = Vec::new();
            for i in 0..8 {
                let e = format!("e{}", (seed + i) % 4);
                let ts = clock.now();
                if (seed + i) % 3 == 0 {
                    ops.push(LwwOp::Remove { element: e, ts });
                } else {
                    ops.push(LwwOp::Add { element: e, ts });
                }
            }

            let mut forward = LwwSet::new();
            for op in ops.iter().cloned() {
                forward.apply(op);
            }
            let mut reverse = LwwSet::new();
            for op in ops.iter().rev().cloned() {
                reverse.apply(op);
            }
            prop_assert_eq!(forward, reverse);
        }
    }
}
