//! In-memory backing store for the agent mesh.
//!
//! Implements every repository trait from `mesh-core` over process-local
//! maps. The server wires these in directly; tests use them as realistic
//! fixtures. A relational implementation can replace this crate without
//! touching the engine.

mod memory;

pub use memory::{
    MemoryAgentRepository, MemoryAuditRepository, MemoryDocumentRepository,
    MemoryTaskRepository, MemoryWorkflowRepository, MemoryWorkspaceRepository,
};

use std::sync::Arc;

/// Bundle of repositories the server and tests share.
#[derive(Clone)]
pub struct Repositories {
    pub agents: Arc<MemoryAgentRepository>,
    pub tasks: Arc<MemoryTaskRepository>,
    pub workflows: Arc<MemoryWorkflowRepository>,
    pub workspaces: Arc<MemoryWorkspaceRepository>,
    pub documents: Arc<MemoryDocumentRepository>,
    pub audit: Arc<MemoryAuditRepository>,
}

impl Repositories {
    pub fn new() -> Self {
        Self {
            agents: Arc::new(MemoryAgentRepository::new()),
            tasks: Arc::new(MemoryTaskRepository::new()),
            workflows: Arc::new(MemoryWorkflowRepository::new()),
            workspaces: Arc::new(MemoryWorkspaceRepository::new()),
            documents: Arc::new(MemoryDocumentRepository::new()),
            audit: Arc::new(MemoryAuditRepository::new()),
        }
    }
}

impl Default for Repositories {
    fn default() -> Self {
        Self::new()
    }
}
