//! Domain entities shared across the mesh.

mod agent;
mod document;
mod task;
mod workflow;
mod workspace;

pub use agent::{AgentProfile, AgentStatus};
pub use document::{ContentType, DocOpKind, DocumentLock, DocumentOperation, SharedDocument};
pub use task::{
    AggregationPolicy, DelegationKind, DistributedSpec, FailurePolicy, NewTask, SubtaskSpec, Task,
    TaskDelegation, TaskFilter, TaskPriority, TaskStatus, WaitPolicy,
};
pub use workflow::{
    ExecutionStatus, GuardCondition, GuardOp, OnFailure, RoleSelector, StepState, Workflow,
    WorkflowExecution, WorkflowKind, WorkflowStep,
};
pub use workspace::{
    MemberRole, Visibility, Workspace, WorkspaceMember, MAX_WORKSPACE_MEMBERS,
};

/// Structured map used for parameters, results, and context values.
pub type Fields = serde_json::Map<String, serde_json::Value>;
