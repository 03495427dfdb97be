//! Persistence traits consumed by the engine.
//!
//! The backing store is an external collaborator; the engine only ever
//! talks to these traits. Implementations must be thread-safe, enforce
//! tenant scoping on every lookup, and support the optimistic `version`
//! column contract for conditional updates.

use async_trait::async_trait;
use uuid::Uuid;

use crate::audit::AuditRecord;
use crate::error::Result;
use crate::models::{
    AgentProfile, AgentStatus, DocumentOperation, SharedDocument, Task, TaskDelegation,
    TaskFilter, Workflow, WorkflowExecution, Workspace, WorkspaceMember,
};

/// Registry of agents per tenant.
#[async_trait]
pub trait AgentRepository: Send + Sync {
    /// Register a new agent.
    ///
    /// # Returns
    /// * `Err(MeshError::Conflict)` - if the agent id is already registered
    async fn register(&self, profile: AgentProfile) -> Result<AgentProfile>;

    /// Fetch an agent by id within a tenant.
    async fn get(&self, tenant_id: &str, agent_id: &str) -> Result<Option<AgentProfile>>;

    /// All agents of a tenant.
    async fn list(&self, tenant_id: &str) -> Result<Vec<AgentProfile>>;

    /// Update availability.
    ///
    /// # Returns
    /// * `Err(MeshError::NotFound)` - if the agent is unknown
    async fn set_status(&self, tenant_id: &str, agent_id: &str, status: AgentStatus)
        -> Result<()>;

    /// Adjust the active-task counter by `delta`, clamped at zero.
    async fn adjust_load(&self, tenant_id: &str, agent_id: &str, delta: i32) -> Result<u32>;

    /// Record a heartbeat.
    async fn heartbeat(&self, tenant_id: &str, agent_id: &str) -> Result<()>;

    /// Liveness probe for the backing store.
    async fn health_check(&self) -> Result<()>;
}

/// Task persistence. Conditional updates use the task's integer `version`.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Persist a new task.
    ///
    /// # Returns
    /// * `Err(MeshError::Conflict)` - if the tenant already holds a task
    ///   with the same idempotency key
    async fn create(&self, task: Task) -> Result<Task>;

    /// Persist a parent and its subtasks atomically; either all land or
    /// none do.
    async fn create_batch(&self, tasks: Vec<Task>) -> Result<Vec<Task>>;

    async fn get(&self, tenant_id: &str, id: Uuid) -> Result<Option<Task>>;

    async fn get_by_idempotency_key(&self, tenant_id: &str, key: &str) -> Result<Option<Task>>;

    /// Conditional update.
    ///
    /// # Returns
    /// * `Ok(Task)` - the stored task with `version` incremented
    /// * `Err(MeshError::OptimisticLock)` - if the stored version differs
    ///   from `expected_version`
    /// * `Err(MeshError::NotFound)` - if the task does not exist
    async fn update_with_version(&self, task: Task, expected_version: u64) -> Result<Task>;

    async fn list(&self, tenant_id: &str, filter: TaskFilter) -> Result<Vec<Task>>;

    /// Children of a distributed parent.
    async fn subtasks_of(&self, tenant_id: &str, parent_id: Uuid) -> Result<Vec<Task>>;

    /// Soft-delete; the task stays queryable by id for audit purposes.
    async fn delete(&self, tenant_id: &str, id: Uuid) -> Result<()>;

    /// Append one delegation hop.
    async fn record_delegation(&self, delegation: TaskDelegation) -> Result<TaskDelegation>;

    /// Delegation history for a task, oldest first.
    async fn delegations_for(&self, tenant_id: &str, task_id: Uuid)
        -> Result<Vec<TaskDelegation>>;

    async fn health_check(&self) -> Result<()>;
}

/// Workflow templates and live executions.
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    /// Persist a workflow template.
    ///
    /// # Returns
    /// * `Err(MeshError::Conflict)` - if an active workflow with the same
    ///   name exists in the tenant
    async fn create(&self, workflow: Workflow) -> Result<Workflow>;

    async fn get(&self, tenant_id: &str, id: Uuid) -> Result<Option<Workflow>>;

    async fn get_by_name(&self, tenant_id: &str, name: &str) -> Result<Option<Workflow>>;

    async fn list(&self, tenant_id: &str) -> Result<Vec<Workflow>>;

    /// Persist a new execution instance.
    async fn create_execution(&self, execution: WorkflowExecution) -> Result<WorkflowExecution>;

    async fn get_execution(&self, tenant_id: &str, id: Uuid) -> Result<Option<WorkflowExecution>>;

    /// Conditional update on the execution's `version` counter.
    ///
    /// # Returns
    /// * `Err(MeshError::OptimisticLock)` - on a version mismatch
    async fn update_execution(
        &self,
        execution: WorkflowExecution,
        expected_version: u64,
    ) -> Result<WorkflowExecution>;

    /// Executions that have not reached a terminal state.
    async fn active_executions(&self, tenant_id: &str) -> Result<Vec<WorkflowExecution>>;

    async fn health_check(&self) -> Result<()>;
}

/// Workspaces and their membership.
#[async_trait]
pub trait WorkspaceRepository: Send + Sync {
    async fn create(&self, workspace: Workspace) -> Result<Workspace>;

    async fn get(&self, tenant_id: &str, id: Uuid) -> Result<Option<Workspace>>;

    /// Conditional update on `state_version`.
    ///
    /// # Returns
    /// * `Err(MeshError::OptimisticLock)` - when the stored state version
    ///   differs from `expected_version`
    async fn update_with_version(
        &self,
        workspace: Workspace,
        expected_version: u64,
    ) -> Result<Workspace>;

    async fn add_member(&self, member: WorkspaceMember) -> Result<WorkspaceMember>;

    async fn remove_member(&self, workspace_id: Uuid, agent_id: &str) -> Result<()>;

    async fn members(&self, workspace_id: Uuid) -> Result<Vec<WorkspaceMember>>;

    async fn get_member(
        &self,
        workspace_id: Uuid,
        agent_id: &str,
    ) -> Result<Option<WorkspaceMember>>;

    async fn health_check(&self) -> Result<()>;
}

/// Shared documents and their operation streams.
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    async fn create(&self, document: SharedDocument) -> Result<SharedDocument>;

    async fn get(&self, tenant_id: &str, id: Uuid) -> Result<Option<SharedDocument>>;

    /// Conditional update on the document's `version`.
    async fn update_with_version(
        &self,
        document: SharedDocument,
        expected_version: u64,
    ) -> Result<SharedDocument>;

    /// Append an operation, assigning the next per-document sequence
    /// number. Returns the stored operation with `sequence` filled in.
    async fn append_operation(&self, operation: DocumentOperation) -> Result<DocumentOperation>;

    /// Operations with `sequence > after`, in sequence order.
    async fn operations_since(
        &self,
        tenant_id: &str,
        document_id: Uuid,
        after: u64,
    ) -> Result<Vec<DocumentOperation>>;

    async fn health_check(&self) -> Result<()>;
}

/// Append-only audit sink.
#[async_trait]
pub trait AuditRepository: Send + Sync {
    async fn record(&self, record: AuditRecord) -> Result<()>;

    /// Records for an entity kind within a tenant, newest first, capped at
    /// `limit`.
    async fn query(
        &self,
        tenant_id: &str,
        entity_kind: Option<&str>,
        limit: usize,
    ) -> Result<Vec<AuditRecord>>;

    async fn health_check(&self) -> Result<()>;
}
