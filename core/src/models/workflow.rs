use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Fields;

/// Shape of a workflow's step graph.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    /// Steps linearized in a deterministic topological order
    Sequential,
    /// Ready steps dispatched concurrently up to `max_parallel`
    Parallel,
    /// Steps may be skipped when their guards evaluate false
    Conditional,
    /// Steps target different roles; role holders are notified
    Collaborative,
}

/// How a role resolves to a concrete agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RoleSelector {
    /// A fixed agent id
    Specific(String),
    /// Any agent declaring all listed capabilities
    Capability(Vec<String>),
    /// Any registered agent
    Any,
}

/// Guard comparison operators.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GuardOp {
    Eq,
    Ne,
    Exists,
}

/// A single guard clause evaluated against the execution context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GuardCondition {
    /// Context field the guard inspects
    pub field: String,
    pub op: GuardOp,
    #[serde(default)]
    pub value: serde_json::Value,
}

impl GuardCondition {
    pub fn evaluate(&self, context: &Fields) -> bool {
        let actual = context.get(&self.field);
        match self.op {
            GuardOp::Exists => actual.is_some(),
            GuardOp::Eq => actual == Some(&self.value),
            GuardOp::Ne => actual != Some(&self.value),
        }
    }
}

/// What to do when a step's task fails terminally.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// Fail the whole execution
    Fail,
    /// Mark the step skipped and unblock dependents
    Skip,
    /// Mark the step failed but keep executing dependents
    Continue,
    /// Re-dispatch the step while its retry budget lasts
    Retry,
}

impl Default for OnFailure {
    fn default() -> Self {
        OnFailure::Fail
    }
}

/// One node of a workflow's step graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowStep {
    /// Unique within the workflow
    pub step_id: String,
    /// Role that performs the step, resolved via the workflow's role map
    pub role: String,
    pub action: String,
    /// Literal inputs; string values like `$step.output` are resolved
    /// against earlier step results at dispatch time
    #[serde(default)]
    pub input: Fields,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub guards: Vec<GuardCondition>,
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub on_failure: OnFailure,
    /// result field → context field copies applied on completion
    #[serde(default)]
    pub output_mapping: HashMap<String, String>,
}

/// A workflow template. The step graph must be a DAG.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workflow {
    pub id: Uuid,
    pub tenant_id: String,
    /// Unique per tenant among active workflows
    pub name: String,
    pub kind: WorkflowKind,
    pub version: u32,
    /// role name → selector
    pub roles: HashMap<String, RoleSelector>,
    pub steps: Vec<WorkflowStep>,
    /// Concurrency cap for parallel workflows
    pub max_parallel: Option<usize>,
    pub global_timeout_secs: Option<u64>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Workflow {
    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Dependency edges as an `id → ids` map.
    pub fn dependency_edges(&self) -> std::collections::BTreeMap<String, Vec<String>> {
        self.steps
            .iter()
            .map(|s| (s.step_id.clone(), s.depends_on.clone()))
            .collect()
    }
}

/// Execution status of a workflow instance.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
                | ExecutionStatus::Timeout
        )
    }
}

/// Per-step progress inside an execution.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepState::Completed | StepState::Failed | StepState::Skipped
        )
    }

    /// Whether dependents of a step in this state may run.
    pub fn unblocks_dependents(&self) -> bool {
        matches!(self, StepState::Completed | StepState::Skipped)
    }
}

/// A live instance of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub tenant_id: String,
    /// What started this execution, e.g. an agent id or `schedule`
    pub trigger: String,
    pub inputs: Fields,
    /// Variables accumulated through output mappings
    pub context: Fields,
    pub step_states: HashMap<String, StepState>,
    pub step_results: HashMap<String, Fields>,
    /// Task spawned for each running step
    pub step_tasks: HashMap<String, Uuid>,
    /// Remaining retry budget per step
    pub step_retries: HashMap<String, u32>,
    /// Most recently dispatched step, for sequential progress reporting
    pub cursor: Option<String>,
    pub status: ExecutionStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl WorkflowExecution {
    pub fn new(workflow: &Workflow, trigger: impl Into<String>, inputs: Fields) -> Self {
        let step_states = workflow
            .steps
            .iter()
            .map(|s| (s.step_id.clone(), StepState::Pending))
            .collect();
        let step_retries = workflow
            .steps
            .iter()
            .map(|s| (s.step_id.clone(), s.retry_count))
            .collect();
        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow.id,
            tenant_id: workflow.tenant_id.clone(),
            trigger: trigger.into(),
            inputs,
            context: Fields::new(),
            step_states,
            step_results: HashMap::new(),
            step_tasks: HashMap::new(),
            step_retries,
            cursor: None,
            status: ExecutionStatus::Pending,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            version: 1,
        }
    }

    /// True once every step is in a terminal state.
    pub fn all_steps_terminal(&self) -> bool {
        self.step_states.values().all(|s| s.is_terminal())
    }

    pub fn any_step_failed(&self) -> bool {
        self.step_states
            .values()
            .any(|s| matches!(s, StepState::Failed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_guard_evaluation() {
        let mut context = Fields::new();
        context.insert("lang".into(), json!("rust"));

        let eq = GuardCondition {
            field: "lang".into(),
            op: GuardOp::Eq,
            value: json!("rust"),
        };
        assert!(eq.evaluate(&context));

        let ne = GuardCondition {
            field: "lang".into(),
            op: GuardOp::Ne,
            value: json!("go"),
        };
        assert!(ne.evaluate(&context));

        let exists = GuardCondition {
            field: "missing".into(),
            op: GuardOp::Exists,
            value: serde_json::Value::Null,
        };
        assert!(!exists.evaluate(&context));
    }

    #[test]
    fn test_step_state_unblocking() {
        assert!(StepState::Completed.unblocks_dependents());
        assert!(StepState::Skipped.unblocks_dependents());
        assert!(!StepState::Failed.unblocks_dependents());
        assert!(!StepState::Running.unblocks_dependents());
    }

    #[test]
    fn test_execution_initial_state() {
        let workflow = Workflow {
            id: Uuid::new_v4(),
            tenant_id: "t1".into(),
            name: "review".into(),
            kind: WorkflowKind::Sequential,
            version: 1,
            roles: HashMap::new(),
            steps: vec![WorkflowStep {
                step_id: "step1".into(),
                role: "analyst".into(),
                action: "analyze".into(),
                input: Fields::new(),
                depends_on: vec![],
                guards: vec![],
                timeout_secs: None,
                retry_count: 2,
                on_failure: OnFailure::Fail,
                output_mapping: HashMap::new(),
            }],
            max_parallel: None,
            global_timeout_secs: None,
            active: true,
            created_at: Utc::now(),
        };

        let execution = WorkflowExecution::new(&workflow, "agent-a", Fields::new());
        assert_eq!(execution.status, ExecutionStatus::Pending);
        assert_eq!(execution.step_states["step1"], StepState::Pending);
        assert_eq!(execution.step_retries["step1"], 2);
        assert!(!execution.all_steps_terminal());
    }
}
