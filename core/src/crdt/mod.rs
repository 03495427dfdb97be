//! Conflict-free replicated data types.
//!
//! Three variants cover the collaborative state the mesh ships between
//! replicas: an RGA sequence for ordered text, a last-write-wins element
//! set for membership-style data, and a PN counter for tallies. All three
//! merge associatively, commutatively, and idempotently, so replicas that
//! have seen the same operations converge regardless of delivery order.

mod counter;
mod lww;
mod rga;

pub use counter::{CounterOp, PnCounter};
pub use lww::{LwwOp, LwwSet};
pub use rga::{ElementId, Rga, RgaOp};

use serde::{Deserialize, Serialize};

use crate::error::{MeshError, Result};

/// Tagged union over the supported CRDT variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Crdt {
    Sequence(Rga),
    Set(LwwSet),
    Counter(PnCounter),
}

/// Operation against a [`Crdt`], matched by variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CrdtOp {
    Sequence(RgaOp),
    Set(lww::LwwOp),
    Counter(counter::CounterOp),
}

impl Crdt {
    pub fn kind(&self) -> &'static str {
        match self {
            Crdt::Sequence(_) => "sequence",
            Crdt::Set(_) => "set",
            Crdt::Counter(_) => "counter",
        }
    }

    /// Apply an operation. Re-applying a known operation is a no-op.
    pub fn apply(&mut self, op: CrdtOp) -> Result<()> {
        match (self, op) {
            (Crdt::Sequence(rga), CrdtOp::Sequence(op)) => {
                rga.apply(op);
                Ok(())
            }
            (Crdt::Set(set), CrdtOp::Set(op)) => {
                set.apply(op);
                Ok(())
            }
            (Crdt::Counter(counter), CrdtOp::Counter(op)) => {
                counter.apply(op);
                Ok(())
            }
            (state, op) => Err(MeshError::Validation(format!(
                "operation {:?} does not match CRDT variant '{}'",
                std::mem::discriminant(&op),
                state.kind()
            ))),
        }
    }

    /// Merge another replica's state into this one.
    pub fn merge(&mut self, other: &Crdt) -> Result<()> {
        match (self, other) {
            (Crdt::Sequence(a), Crdt::Sequence(b)) => {
                a.merge(b);
                Ok(())
            }
            (Crdt::Set(a), Crdt::Set(b)) => {
                a.merge(b);
                Ok(())
            }
            (Crdt::Counter(a), Crdt::Counter(b)) => {
                a.merge(b);
                Ok(())
            }
            (state, other) => Err(MeshError::Validation(format!(
                "cannot merge CRDT variant '{}' into '{}'",
                other.kind(),
                state.kind()
            ))),
        }
    }
}
