use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Fields;

/// Task lifecycle states.
///
/// The typical flow is Pending → Assigned → Accepted → InProgress →
/// Completed. Cancellation is allowed from any non-terminal state; a
/// rejection sends the task back to Pending with its retry count bumped.
///
/// Terminal states are Completed, Failed, Cancelled, and Timeout.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Accepted,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Timeout
        )
    }

    /// Check if a task in this state may move to `new_status`.
    pub fn can_transition_to(&self, new_status: TaskStatus) -> bool {
        use TaskStatus::*;

        match (self, new_status) {
            (current, new) if *current == new => false,

            (Pending, Assigned | Cancelled | Timeout | Failed) => true,
            (Assigned, Accepted | Pending | Cancelled | Timeout | Failed) => true,
            (Accepted, InProgress | Pending | Cancelled | Timeout | Failed) => true,
            (InProgress, Completed | Failed | Cancelled | Timeout) => true,

            // Terminal states never move
            (Completed | Failed | Cancelled | Timeout, _) => false,

            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Accepted => "accepted",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Timeout => "timeout",
        };
        write!(f, "{s}")
    }
}

/// Scheduling priority.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

/// A unit of delegated work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: Uuid,
    pub tenant_id: String,
    /// Free-form type string, at most 100 characters
    pub task_type: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub created_by: String,
    pub assigned_to: Option<String>,
    /// Parent task for subtasks of a distributed task
    pub parent_id: Option<Uuid>,
    /// Tasks that must complete before this one may start
    pub depends_on: Vec<Uuid>,
    pub parameters: Fields,
    /// Present exactly when status is Completed
    pub result: Option<Fields>,
    /// Present exactly when status is Failed
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_secs: u64,
    /// Fan-out description when this task is a distributed parent
    pub distributed: Option<DistributedSpec>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Monotonic counter for optimistic updates
    pub version: u64,
}

impl Task {
    pub fn can_transition_to(&self, new_status: TaskStatus) -> bool {
        self.status.can_transition_to(new_status)
    }

    /// Whether `agent_id` is the current assignee.
    pub fn is_assigned_to(&self, agent_id: &str) -> bool {
        self.assigned_to.as_deref() == Some(agent_id)
    }

    pub fn retries_left(&self) -> u32 {
        self.max_retries.saturating_sub(self.retry_count)
    }
}

/// Data transfer object for creating tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub tenant_id: String,
    pub task_type: String,
    #[serde(default)]
    pub priority: TaskPriority,
    pub created_by: String,
    pub assigned_to: Option<String>,
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub depends_on: Vec<Uuid>,
    #[serde(default)]
    pub parameters: Fields,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    pub idempotency_key: Option<String>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_timeout_secs() -> u64 {
    300
}

impl NewTask {
    pub fn new(
        tenant_id: impl Into<String>,
        task_type: impl Into<String>,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            task_type: task_type.into(),
            priority: TaskPriority::Normal,
            created_by: created_by.into(),
            assigned_to: None,
            parent_id: None,
            depends_on: Vec::new(),
            parameters: Fields::new(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            idempotency_key: None,
        }
    }

    /// Materialize the task with a fresh id and version 1.
    pub fn into_task(self) -> Task {
        Task {
            id: Uuid::new_v4(),
            tenant_id: self.tenant_id,
            task_type: self.task_type,
            status: if self.assigned_to.is_some() {
                TaskStatus::Assigned
            } else {
                TaskStatus::Pending
            },
            priority: self.priority,
            created_by: self.created_by,
            assigned_at: self.assigned_to.as_ref().map(|_| Utc::now()),
            assigned_to: self.assigned_to,
            parent_id: self.parent_id,
            depends_on: self.depends_on,
            parameters: self.parameters,
            result: None,
            error: None,
            retry_count: 0,
            max_retries: self.max_retries,
            timeout_secs: self.timeout_secs,
            distributed: None,
            idempotency_key: self.idempotency_key,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            version: 1,
        }
    }
}

/// Filter criteria for listing tasks. Fields combine with AND logic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub assigned_to: Option<String>,
    pub created_by: Option<String>,
    pub task_type: Option<String>,
    pub parent_id: Option<Uuid>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Why a task moved between agents.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DelegationKind {
    Manual,
    Automatic,
    Failover,
    LoadBalance,
}

/// Immutable record of a single delegation hop. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskDelegation {
    pub id: Uuid,
    pub task_id: Uuid,
    pub tenant_id: String,
    pub from_agent: String,
    pub to_agent: String,
    pub reason: String,
    pub kind: DelegationKind,
    pub metadata: Fields,
    pub delegated_at: DateTime<Utc>,
}

/// How subtask results are folded into the parent's result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AggregationPolicy {
    /// Shallow-merge all result maps
    Combine,
    /// Per-key arithmetic mean over numeric fields
    Average,
    /// Per-key sum over numeric fields
    Sum,
    /// Subtasks are map stages; the reduce stage is a shallow merge keyed
    /// by subtask id
    MapReduce,
    /// Named reducer registered with the engine
    Custom(String),
}

/// When the parent of a distributed task is considered finished.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WaitPolicy {
    /// Every subtask must reach a terminal state
    WaitForAll,
    /// Complete as soon as this many subtasks succeed
    FirstN(u32),
}

/// How a subtask failure affects the parent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// First failure fails the parent and cancels the remaining subtasks
    FailFast,
    /// Aggregate whatever succeeded; record a partial-failure marker
    ContinueOnFailure,
}

/// Fan-out description attached to a distributed parent task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DistributedSpec {
    pub aggregation: AggregationPolicy,
    pub wait_policy: WaitPolicy,
    pub failure_policy: FailurePolicy,
    /// Subtask ids in declaration order
    pub subtask_ids: Vec<String>,
}

/// Declaration of one subtask inside a distributed task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskSpec {
    /// Unique within the parent
    pub subtask_id: String,
    pub task_type: String,
    #[serde(default)]
    pub parameters: Fields,
    /// Other subtask ids this one waits for
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(status: TaskStatus) -> Task {
        let mut t = NewTask::new("t1", "code_review", "agent-a").into_task();
        t.status = status;
        t
    }

    #[test]
    fn test_happy_path_transitions() {
        assert!(task(TaskStatus::Pending).can_transition_to(TaskStatus::Assigned));
        assert!(task(TaskStatus::Assigned).can_transition_to(TaskStatus::Accepted));
        assert!(task(TaskStatus::Accepted).can_transition_to(TaskStatus::InProgress));
        assert!(task(TaskStatus::InProgress).can_transition_to(TaskStatus::Completed));
        assert!(task(TaskStatus::InProgress).can_transition_to(TaskStatus::Failed));
    }

    #[test]
    fn test_reject_returns_to_pending() {
        assert!(task(TaskStatus::Assigned).can_transition_to(TaskStatus::Pending));
        assert!(task(TaskStatus::Accepted).can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn test_cancel_from_any_live_state() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Assigned,
            TaskStatus::Accepted,
            TaskStatus::InProgress,
        ] {
            assert!(task(status).can_transition_to(TaskStatus::Cancelled));
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
            TaskStatus::Timeout,
        ] {
            assert!(terminal.is_terminal());
            for next in [
                TaskStatus::Pending,
                TaskStatus::Assigned,
                TaskStatus::InProgress,
                TaskStatus::Completed,
            ] {
                assert!(!task(terminal).can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_no_same_state_transition() {
        assert!(!task(TaskStatus::Pending).can_transition_to(TaskStatus::Pending));
        assert!(!task(TaskStatus::InProgress).can_transition_to(TaskStatus::InProgress));
    }

    #[test]
    fn test_new_task_with_assignee_starts_assigned() {
        let mut new_task = NewTask::new("t1", "build", "creator");
        new_task.assigned_to = Some("worker".into());
        let t = new_task.into_task();
        assert_eq!(t.status, TaskStatus::Assigned);
        assert!(t.assigned_at.is_some());
        assert_eq!(t.version, 1);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
    }
}
