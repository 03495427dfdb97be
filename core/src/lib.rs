//! Core domain types and state machinery for the agent mesh.
//!
//! This crate holds everything the collaboration server shares across its
//! layers: the error taxonomy, hybrid logical clocks, CRDT primitives, the
//! MVCC store, the merge engine, the operation log, entity models, and the
//! repository traits the storage layer implements.

pub mod audit;
pub mod clock;
pub mod crdt;
pub mod dag;
pub mod error;
pub mod merge;
pub mod models;
pub mod mvcc;
pub mod oplog;
pub mod repository;
pub mod validation;

pub use audit::{AuditAction, AuditRecord};
pub use clock::{CausalOrder, HlcTimestamp, HybridLogicalClock, VectorClock};
pub use crdt::{Crdt, CrdtOp, ElementId, LwwOp, LwwSet, PnCounter, Rga, RgaOp};
pub use error::{MeshError, Result};
pub use merge::{MergeContext, MergeEngine, MergeResult, MergeStrategy};
pub use models::*;
pub use mvcc::{IsolationLevel, MvccStore, Transaction};
pub use oplog::{OperationLog, OperationRecord, OplogConfig, OplogFilter, OplogStats};
pub use repository::{
    AgentRepository, AuditRepository, DocumentRepository, TaskRepository, WorkflowRepository,
    WorkspaceRepository,
};
