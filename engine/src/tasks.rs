//! Task lifecycle engine.
//!
//! Creation, assignment, delegation, acceptance, completion, distributed
//! fan-in, retry bookkeeping, and advisory execution locks. Every state
//! transition goes through the repository's conditional update, so two
//! racing writers can never both win the same version.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use mesh_core::clock::HybridLogicalClock;
use mesh_core::error::{MeshError, Result};
use mesh_core::models::{
    AggregationPolicy, AgentStatus, DelegationKind, DistributedSpec, FailurePolicy, Fields,
    NewTask, SubtaskSpec, Task, TaskDelegation, TaskFilter, TaskStatus, WaitPolicy,
};
use mesh_core::oplog::OperationLog;
use mesh_core::repository::{AgentRepository, TaskRepository};
use mesh_core::validation;

use crate::distributed::{aggregate, ReducerRegistry};
use crate::notify::NotificationSink;
use crate::recorder::AuditRecorder;
use crate::selection::{AgentSelector, SelectionCriteria, SelectionPolicy};

/// Capability that allows delegating tasks one neither owns nor created.
pub const CAP_DELEGATE_ANY: &str = "task:delegate:any";

/// Engine limits.
#[derive(Debug, Clone)]
pub struct TaskEngineConfig {
    pub max_retries_cap: u32,
    pub max_delegation_depth: u32,
    pub default_lock_duration: Duration,
}

impl Default for TaskEngineConfig {
    fn default() -> Self {
        Self {
            max_retries_cap: validation::MAX_RETRIES_CAP,
            max_delegation_depth: 3,
            default_lock_duration: Duration::from_secs(60),
        }
    }
}

struct ExecutionLock {
    agent_id: String,
    expires_at: Instant,
}

/// The engine. Shared behind an `Arc`.
pub struct TaskEngine {
    tasks: Arc<dyn TaskRepository>,
    agents: Arc<dyn AgentRepository>,
    oplog: OperationLog,
    recorder: AuditRecorder,
    sink: Arc<dyn NotificationSink>,
    clock: Arc<HybridLogicalClock>,
    selector: AgentSelector,
    reducers: ReducerRegistry,
    config: TaskEngineConfig,
    exec_locks: Mutex<HashMap<Uuid, ExecutionLock>>,
}

impl TaskEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        agents: Arc<dyn AgentRepository>,
        oplog: OperationLog,
        recorder: AuditRecorder,
        sink: Arc<dyn NotificationSink>,
        clock: Arc<HybridLogicalClock>,
        reducers: ReducerRegistry,
        config: TaskEngineConfig,
    ) -> Self {
        Self {
            tasks,
            agents,
            oplog,
            recorder,
            sink,
            clock,
            selector: AgentSelector::new(),
            reducers,
            config,
            exec_locks: Mutex::new(HashMap::new()),
        }
    }

    fn stream_for(task_id: Uuid) -> String {
        format!("task:{task_id}")
    }

    async fn load(&self, tenant_id: &str, id: Uuid) -> Result<Task> {
        self.tasks
            .get(tenant_id, id)
            .await?
            .ok_or_else(|| MeshError::not_found("task", id))
    }

    /// Persist a changed task, re-reading and re-applying `mutate` when a
    /// concurrent writer won the version race. Used for engine-internal
    /// transitions where the caller holds no version expectation.
    async fn update_retrying<F>(&self, tenant_id: &str, id: Uuid, mutate: F) -> Result<Task>
    where
        F: Fn(&mut Task) -> Result<()>,
    {
        let mut attempts = 0u8;
        loop {
            let mut task = self.load(tenant_id, id).await?;
            let expected = task.version;
            mutate(&mut task)?;
            match self.tasks.update_with_version(task, expected).await {
                Ok(stored) => return Ok(stored),
                Err(MeshError::OptimisticLock { .. }) if attempts < 5 => {
                    attempts += 1;
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn journal(&self, task: &Task, kind: &str, principal: &str, payload: Value) {
        if let Err(err) = self
            .oplog
            .append(Self::stream_for(task.id), principal, kind, &payload)
        {
            warn!(%err, task_id = %task.id, "oplog append failed");
        }
    }

    fn adjust_load_soon(&self, tenant_id: &str, agent_id: &str, delta: i32) {
        // Load accounting is advisory; failures only cost selection quality.
        let agents = self.agents.clone();
        let tenant_id = tenant_id.to_string();
        let agent_id = agent_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = agents.adjust_load(&tenant_id, &agent_id, delta).await {
                debug!(%err, agent_id, "load adjustment skipped");
            }
        });
    }

    // ------------------------------------------------------------------
    // Creation

    /// Create a task. With an idempotency key, an existing task under the
    /// same tenant and key is returned instead of creating a duplicate.
    pub async fn create(&self, new_task: NewTask) -> Result<Task> {
        validation::validate_new_task(&new_task)?;
        if new_task.max_retries > self.config.max_retries_cap {
            return Err(MeshError::Validation(format!(
                "max_retries exceeds the configured cap of {}",
                self.config.max_retries_cap
            )));
        }

        if let Some(key) = &new_task.idempotency_key {
            if let Some(existing) = self
                .tasks
                .get_by_idempotency_key(&new_task.tenant_id, key)
                .await?
            {
                debug!(task_id = %existing.id, key, "idempotent create hit");
                return Ok(existing);
            }
        }

        if let Some(assignee) = &new_task.assigned_to {
            self.require_available_agent(&new_task.tenant_id, assignee)
                .await?;
        }

        let task = new_task.into_task();
        let stored = self.tasks.create(task).await?;

        self.journal(
            &stored,
            "task_created",
            &stored.created_by,
            json!({ "task_type": stored.task_type, "priority": stored.priority }),
        )
        .await;
        self.recorder
            .insert(
                &stored.tenant_id,
                "task",
                stored.id,
                &stored,
                &stored.created_by,
            )
            .await;

        if let Some(assignee) = &stored.assigned_to {
            self.adjust_load_soon(&stored.tenant_id, assignee, 1);
            self.sink.notify_agent(
                &stored.tenant_id,
                assignee,
                "task.assigned",
                json!({ "task_id": stored.id, "task_type": stored.task_type }),
            );
        }

        info!(task_id = %stored.id, task_type = %stored.task_type, "task created");
        Ok(stored)
    }

    /// Create a distributed parent with its subtasks in one shot. The
    /// subtask graph must be acyclic; assignees are resolved up front.
    pub async fn create_distributed(
        &self,
        parent: NewTask,
        subtasks: Vec<SubtaskSpec>,
        aggregation: AggregationPolicy,
        wait_policy: WaitPolicy,
        failure_policy: FailurePolicy,
    ) -> Result<(Task, Vec<Task>)> {
        validation::validate_new_task(&parent)?;
        validation::validate_subtasks(&subtasks)?;
        if let AggregationPolicy::Custom(name) = &aggregation {
            if !self.reducers.contains(name) {
                return Err(MeshError::InvalidParams(format!(
                    "unknown custom aggregator '{name}'"
                )));
            }
        }
        if let WaitPolicy::FirstN(n) = wait_policy {
            if n == 0 || n as usize > subtasks.len() {
                return Err(MeshError::InvalidParams(format!(
                    "first_n of {n} is outside 1..={}",
                    subtasks.len()
                )));
            }
        }

        if let Some(key) = &parent.idempotency_key {
            if let Some(existing) = self
                .tasks
                .get_by_idempotency_key(&parent.tenant_id, key)
                .await?
            {
                let children = self
                    .tasks
                    .subtasks_of(&parent.tenant_id, existing.id)
                    .await?;
                return Ok((existing, children));
            }
        }

        let tenant_id = parent.tenant_id.clone();
        let creator = parent.created_by.clone();

        let mut parent_task = parent.into_task();
        parent_task.distributed = Some(DistributedSpec {
            aggregation,
            wait_policy,
            failure_policy,
            subtask_ids: subtasks.iter().map(|s| s.subtask_id.clone()).collect(),
        });

        // Resolve ids first so dependencies can point at sibling tasks.
        let id_by_name: HashMap<String, Uuid> = subtasks
            .iter()
            .map(|s| (s.subtask_id.clone(), Uuid::new_v4()))
            .collect();

        let mut children = Vec::with_capacity(subtasks.len());
        for spec in &subtasks {
            let assignee = match &spec.assigned_to {
                Some(agent) => {
                    self.require_available_agent(&tenant_id, agent).await?;
                    Some(agent.clone())
                }
                None => {
                    let criteria = SelectionCriteria {
                        required_capabilities: spec.required_capabilities.clone(),
                        ..Default::default()
                    };
                    self.select_agent(&tenant_id, SelectionPolicy::LeastLoaded, &criteria)
                        .await
                        .ok()
                }
            };

            let mut new_child = NewTask::new(&tenant_id, &spec.task_type, &creator);
            new_child.assigned_to = assignee;
            new_child.parent_id = Some(parent_task.id);
            new_child.parameters = spec.parameters.clone();
            new_child.depends_on = spec
                .depends_on
                .iter()
                .filter_map(|name| id_by_name.get(name).copied())
                .collect();
            let mut child = new_child.into_task();
            child.id = id_by_name[&spec.subtask_id];
            child
                .parameters
                .insert("subtask_id".to_string(), json!(spec.subtask_id));
            children.push(child);
        }

        let mut batch = vec![parent_task.clone()];
        batch.extend(children.iter().cloned());
        let mut stored = self.tasks.create_batch(batch).await?;
        let stored_parent = stored.remove(0);

        self.journal(
            &stored_parent,
            "distributed_created",
            &creator,
            json!({ "subtasks": stored.len() }),
        )
        .await;
        self.recorder
            .insert(&tenant_id, "task", stored_parent.id, &stored_parent, &creator)
            .await;

        for child in &stored {
            if let Some(assignee) = &child.assigned_to {
                self.adjust_load_soon(&tenant_id, assignee, 1);
                self.sink.notify_agent(
                    &tenant_id,
                    assignee,
                    "task.assigned",
                    json!({ "task_id": child.id, "parent_id": stored_parent.id }),
                );
            }
        }

        info!(task_id = %stored_parent.id, subtasks = stored.len(), "distributed task created");
        Ok((stored_parent, stored))
    }

    // ------------------------------------------------------------------
    // Reads

    pub async fn get(&self, tenant_id: &str, id: Uuid) -> Result<Task> {
        self.load(tenant_id, id).await
    }

    pub async fn get_by_idempotency_key(&self, tenant_id: &str, key: &str) -> Result<Option<Task>> {
        self.tasks.get_by_idempotency_key(tenant_id, key).await
    }

    pub async fn list(&self, tenant_id: &str, filter: TaskFilter) -> Result<Vec<Task>> {
        self.tasks.list(tenant_id, filter).await
    }

    pub async fn delegations(&self, tenant_id: &str, task_id: Uuid) -> Result<Vec<TaskDelegation>> {
        self.tasks.delegations_for(tenant_id, task_id).await
    }

    // ------------------------------------------------------------------
    // Assignment and delegation

    async fn require_available_agent(&self, tenant_id: &str, agent_id: &str) -> Result<()> {
        let agent = self
            .agents
            .get(tenant_id, agent_id)
            .await?
            .ok_or_else(|| MeshError::not_found("agent", agent_id))?;
        if agent.status == AgentStatus::Offline {
            return Err(MeshError::Conflict(format!(
                "agent '{agent_id}' is offline"
            )));
        }
        Ok(())
    }

    /// Conditional update with the caller's observed version. Rejects
    /// transitions the state machine forbids.
    pub async fn update_with_version(&self, task: Task, expected_version: u64) -> Result<Task> {
        let current = self.load(&task.tenant_id, task.id).await?;
        if current.status != task.status && !current.can_transition_to(task.status) {
            return Err(MeshError::Conflict(format!(
                "task cannot move from {} to {}",
                current.status, task.status
            )));
        }
        let old = current.clone();
        let stored = self.tasks.update_with_version(task, expected_version).await?;
        self.recorder
            .update(&stored.tenant_id, "task", stored.id, &old, &stored, "system")
            .await;
        Ok(stored)
    }

    pub async fn assign(
        &self,
        tenant_id: &str,
        id: Uuid,
        agent_id: &str,
        assigned_by: &str,
    ) -> Result<Task> {
        validation::validate_agent_id(agent_id)?;
        self.require_available_agent(tenant_id, agent_id).await?;

        let task = self.load(tenant_id, id).await?;
        if !task.can_transition_to(TaskStatus::Assigned) {
            return Err(MeshError::Conflict(format!(
                "task in status {} cannot be assigned",
                task.status
            )));
        }

        let old = task.clone();
        let expected = task.version;
        let mut updated = task;
        updated.status = TaskStatus::Assigned;
        updated.assigned_to = Some(agent_id.to_string());
        updated.assigned_at = Some(chrono::Utc::now());
        let stored = self.tasks.update_with_version(updated, expected).await?;

        self.adjust_load_soon(tenant_id, agent_id, 1);
        self.journal(
            &stored,
            "task_assigned",
            assigned_by,
            json!({ "assigned_to": agent_id }),
        )
        .await;
        self.recorder
            .update(tenant_id, "task", stored.id, &old, &stored, assigned_by)
            .await;
        self.sink.notify_agent(
            tenant_id,
            agent_id,
            "task.assigned",
            json!({ "task_id": stored.id, "task_type": stored.task_type }),
        );
        Ok(stored)
    }

    pub async fn unassign(&self, tenant_id: &str, id: Uuid, reason: &str) -> Result<Task> {
        let task = self.load(tenant_id, id).await?;
        let previous = match &task.assigned_to {
            Some(agent) => agent.clone(),
            None => {
                return Err(MeshError::Conflict("task has no assignee".into()));
            }
        };
        if !task.can_transition_to(TaskStatus::Pending) {
            return Err(MeshError::Conflict(format!(
                "task in status {} cannot be unassigned",
                task.status
            )));
        }

        let expected = task.version;
        let mut updated = task;
        updated.status = TaskStatus::Pending;
        updated.assigned_to = None;
        updated.assigned_at = None;
        let stored = self.tasks.update_with_version(updated, expected).await?;

        self.adjust_load_soon(tenant_id, &previous, -1);
        self.journal(&stored, "task_unassigned", "system", json!({ "reason": reason }))
            .await;
        Ok(stored)
    }

    /// Hand a task to another agent. Allowed for the current assignee, the
    /// creator, or a principal holding `task:delegate:any`. The target
    /// must exist, be reachable, and satisfy the task's declared
    /// capability requirements; the delegation chain is depth-bounded.
    #[allow(clippy::too_many_arguments)]
    pub async fn delegate(
        &self,
        tenant_id: &str,
        id: Uuid,
        by: &str,
        by_capabilities: &[String],
        to_agent: &str,
        reason: &str,
        kind: DelegationKind,
        metadata: Fields,
    ) -> Result<Task> {
        let task = self.load(tenant_id, id).await?;

        let allowed = task.is_assigned_to(by)
            || task.created_by == by
            || by_capabilities.iter().any(|c| c == CAP_DELEGATE_ANY || c == "admin");
        if !allowed {
            return Err(MeshError::Forbidden(
                "only the assignee, the creator, or a delegation admin may delegate".into(),
            ));
        }
        if task.status.is_terminal() {
            return Err(MeshError::Conflict(format!(
                "task in status {} cannot be delegated",
                task.status
            )));
        }

        validation::validate_agent_id(to_agent)?;
        let target = self
            .agents
            .get(tenant_id, to_agent)
            .await?
            .ok_or_else(|| MeshError::not_found("agent", to_agent))?;
        if !target.is_available() {
            return Err(MeshError::Conflict(format!(
                "agent '{to_agent}' is not available"
            )));
        }
        let required: Vec<String> = task
            .parameters
            .get("required_capabilities")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        if !target.has_capabilities(&required) {
            return Err(MeshError::Validation(format!(
                "agent '{to_agent}' lacks required capabilities {required:?}"
            )));
        }

        let history = self.tasks.delegations_for(tenant_id, id).await?;
        if history.len() as u32 >= self.config.max_delegation_depth {
            return Err(MeshError::Conflict(format!(
                "delegation depth limit of {} reached",
                self.config.max_delegation_depth
            )));
        }

        let previous = task.assigned_to.clone();
        let expected = task.version;
        let mut updated = task;
        updated.status = TaskStatus::Assigned;
        updated.assigned_to = Some(to_agent.to_string());
        updated.assigned_at = Some(chrono::Utc::now());
        let stored = self.tasks.update_with_version(updated, expected).await?;

        let delegation = TaskDelegation {
            id: Uuid::new_v4(),
            task_id: id,
            tenant_id: tenant_id.to_string(),
            from_agent: previous.clone().unwrap_or_else(|| by.to_string()),
            to_agent: to_agent.to_string(),
            reason: reason.to_string(),
            kind,
            metadata,
            delegated_at: chrono::Utc::now(),
        };
        self.tasks.record_delegation(delegation.clone()).await?;

        if let Some(previous) = &previous {
            self.adjust_load_soon(tenant_id, previous, -1);
        }
        self.adjust_load_soon(tenant_id, to_agent, 1);

        self.journal(
            &stored,
            "task_delegated",
            by,
            json!({ "from": delegation.from_agent, "to": to_agent, "reason": reason }),
        )
        .await;
        self.recorder
            .insert(tenant_id, "task_delegation", delegation.id, &delegation, by)
            .await;
        self.sink.notify_agent(
            tenant_id,
            to_agent,
            "task.delegated",
            json!({ "task_id": id, "from": delegation.from_agent, "reason": reason }),
        );

        info!(task_id = %id, from = %delegation.from_agent, to = %to_agent, "task delegated");
        Ok(stored)
    }

    // ------------------------------------------------------------------
    // Acceptance and completion

    /// Accept an assigned task. The conditional update makes acceptance
    /// exclusive: of two racing accepts, exactly one wins the version.
    pub async fn accept(
        &self,
        tenant_id: &str,
        id: Uuid,
        agent_id: &str,
        estimated_duration_secs: Option<u64>,
    ) -> Result<Task> {
        let task = self.load(tenant_id, id).await?;
        if !task.is_assigned_to(agent_id) {
            return Err(MeshError::Forbidden(
                "only the current assignee may accept".into(),
            ));
        }
        if matches!(task.status, TaskStatus::Accepted | TaskStatus::InProgress) {
            return Err(MeshError::Conflict("task already accepted".into()));
        }
        if task.status != TaskStatus::Assigned {
            return Err(MeshError::Conflict(format!(
                "task in status {} cannot be accepted",
                task.status
            )));
        }

        let expected = task.version;
        let mut updated = task;
        updated.status = TaskStatus::Accepted;
        if let Some(secs) = estimated_duration_secs {
            updated
                .parameters
                .insert("estimated_duration_secs".to_string(), json!(secs));
        }
        let stored = self.tasks.update_with_version(updated, expected).await?;

        self.journal(&stored, "task_accepted", agent_id, json!({})).await;
        Ok(stored)
    }

    /// Mark an accepted task as actively running.
    pub async fn start(&self, tenant_id: &str, id: Uuid, agent_id: &str) -> Result<Task> {
        let task = self.load(tenant_id, id).await?;
        if !task.is_assigned_to(agent_id) {
            return Err(MeshError::Forbidden(
                "only the current assignee may start".into(),
            ));
        }
        if task.status != TaskStatus::Accepted {
            return Err(MeshError::Conflict(format!(
                "task in status {} cannot start",
                task.status
            )));
        }
        let expected = task.version;
        let mut updated = task;
        updated.status = TaskStatus::InProgress;
        updated.started_at = Some(chrono::Utc::now());
        self.tasks.update_with_version(updated, expected).await
    }

    /// Complete a task. Only the assignee may complete, from Accepted (the
    /// completion doubles as the first progress signal) or InProgress.
    pub async fn complete(
        &self,
        tenant_id: &str,
        id: Uuid,
        agent_id: &str,
        result: Fields,
    ) -> Result<Task> {
        let task = self.load(tenant_id, id).await?;
        if !task.is_assigned_to(agent_id) {
            return Err(MeshError::Forbidden(
                "only the current assignee may complete".into(),
            ));
        }
        if !matches!(task.status, TaskStatus::Accepted | TaskStatus::InProgress) {
            return Err(MeshError::Conflict(format!(
                "task in status {} cannot be completed",
                task.status
            )));
        }

        let old = task.clone();
        let expected = task.version;
        let now = chrono::Utc::now();
        let mut updated = task;
        if updated.started_at.is_none() {
            updated.started_at = Some(now);
        }
        updated.status = TaskStatus::Completed;
        updated.result = Some(result.clone());
        updated.completed_at = Some(now);
        let stored = self.tasks.update_with_version(updated, expected).await?;

        self.adjust_load_soon(tenant_id, agent_id, -1);
        self.journal(&stored, "task_completed", agent_id, json!({ "result": result }))
            .await;
        self.recorder
            .update(tenant_id, "task", stored.id, &old, &stored, agent_id)
            .await;
        self.sink.notify_agent(
            tenant_id,
            &stored.created_by,
            "task.completed",
            json!({ "task_id": stored.id }),
        );

        if let Some(parent_id) = stored.parent_id {
            self.evaluate_distributed(tenant_id, parent_id).await?;
        }
        Ok(stored)
    }

    /// Fail a task with an error string. Retry budgeting is the caller's
    /// concern via [`TaskEngine::increment_retry`].
    pub async fn fail(
        &self,
        tenant_id: &str,
        id: Uuid,
        agent_id: &str,
        error: &str,
    ) -> Result<Task> {
        let task = self.load(tenant_id, id).await?;
        if !task.is_assigned_to(agent_id) {
            return Err(MeshError::Forbidden(
                "only the current assignee may fail the task".into(),
            ));
        }
        if task.status.is_terminal() {
            return Err(MeshError::Conflict("task already finished".into()));
        }

        let expected = task.version;
        let mut updated = task;
        updated.status = TaskStatus::Failed;
        updated.error = Some(error.to_string());
        updated.completed_at = Some(chrono::Utc::now());
        let stored = self.tasks.update_with_version(updated, expected).await?;

        self.adjust_load_soon(tenant_id, agent_id, -1);
        self.journal(&stored, "task_failed", agent_id, json!({ "error": error }))
            .await;

        if let Some(parent_id) = stored.parent_id {
            self.evaluate_distributed(tenant_id, parent_id).await?;
        }
        Ok(stored)
    }

    pub async fn cancel(&self, tenant_id: &str, id: Uuid, by: &str, reason: &str) -> Result<Task> {
        let task = self.load(tenant_id, id).await?;
        if task.status.is_terminal() {
            return Err(MeshError::Conflict("task already finished".into()));
        }
        let assignee = task.assigned_to.clone();
        let expected = task.version;
        let mut updated = task;
        updated.status = TaskStatus::Cancelled;
        updated.completed_at = Some(chrono::Utc::now());
        let stored = self.tasks.update_with_version(updated, expected).await?;

        if let Some(assignee) = &assignee {
            self.adjust_load_soon(tenant_id, assignee, -1);
            self.sink.notify_agent(
                tenant_id,
                assignee,
                "task.cancelled",
                json!({ "task_id": id, "reason": reason }),
            );
        }
        self.journal(&stored, "task_cancelled", by, json!({ "reason": reason }))
            .await;
        Ok(stored)
    }

    /// Record a subtask's result directly and fold it into the parent.
    pub async fn submit_subtask_result(
        &self,
        tenant_id: &str,
        parent_id: Uuid,
        subtask_id: &str,
        result: Fields,
    ) -> Result<Task> {
        let children = self.tasks.subtasks_of(tenant_id, parent_id).await?;
        let child = children
            .into_iter()
            .find(|t| {
                t.parameters.get("subtask_id").and_then(|v| v.as_str()) == Some(subtask_id)
            })
            .ok_or_else(|| MeshError::not_found("subtask", subtask_id))?;

        if !child.status.is_terminal() {
            self.update_retrying(tenant_id, child.id, |task| {
                if task.status.is_terminal() {
                    return Ok(());
                }
                if task.started_at.is_none() {
                    task.started_at = Some(chrono::Utc::now());
                }
                task.status = TaskStatus::Completed;
                task.result = Some(result.clone());
                task.completed_at = Some(chrono::Utc::now());
                Ok(())
            })
            .await?;
        }

        self.evaluate_distributed(tenant_id, parent_id).await?;
        self.load(tenant_id, parent_id).await
    }

    /// Re-evaluate a distributed parent after a subtask reached a terminal
    /// state: apply the failure policy, then the wait policy, then the
    /// aggregation policy.
    async fn evaluate_distributed(&self, tenant_id: &str, parent_id: Uuid) -> Result<()> {
        let parent = self.load(tenant_id, parent_id).await?;
        let spec = match &parent.distributed {
            Some(spec) => spec.clone(),
            None => return Ok(()),
        };
        if parent.status.is_terminal() {
            return Ok(());
        }

        let children = self.tasks.subtasks_of(tenant_id, parent_id).await?;
        let by_name = |child: &Task| -> String {
            child
                .parameters
                .get("subtask_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };

        let mut successes: Vec<(String, Fields)> = Vec::new();
        let mut failed: Vec<String> = Vec::new();
        let mut pending = 0usize;
        for child in &children {
            match child.status {
                TaskStatus::Completed => {
                    successes.push((by_name(child), child.result.clone().unwrap_or_default()));
                }
                TaskStatus::Failed | TaskStatus::Timeout => failed.push(by_name(child)),
                TaskStatus::Cancelled => {}
                _ => pending += 1,
            }
        }
        // Keep declaration order for deterministic aggregation.
        successes.sort_by_key(|(name, _)| {
            spec.subtask_ids
                .iter()
                .position(|id| id == name)
                .unwrap_or(usize::MAX)
        });
        failed.sort_by_key(|name| {
            spec.subtask_ids
                .iter()
                .position(|id| id == name)
                .unwrap_or(usize::MAX)
        });

        if spec.failure_policy == FailurePolicy::FailFast && !failed.is_empty() {
            self.cancel_children(tenant_id, &children).await;
            self.update_retrying(tenant_id, parent_id, |task| {
                if task.status.is_terminal() {
                    return Ok(());
                }
                task.status = TaskStatus::Failed;
                task.error = Some(format!("subtask '{}' failed", failed[0]));
                task.completed_at = Some(chrono::Utc::now());
                Ok(())
            })
            .await?;
            self.sink.notify_agent(
                tenant_id,
                &parent.created_by,
                "task.failed",
                json!({ "task_id": parent_id, "failed_subtasks": failed }),
            );
            return Ok(());
        }

        let satisfied = match spec.wait_policy {
            WaitPolicy::WaitForAll => pending == 0,
            WaitPolicy::FirstN(n) => successes.len() as u32 >= n,
        };
        if !satisfied {
            return Ok(());
        }

        if matches!(spec.wait_policy, WaitPolicy::FirstN(_)) {
            self.cancel_children(tenant_id, &children).await;
        }

        // Under wait_for_all with nothing succeeded, the parent failed.
        if successes.is_empty() && !failed.is_empty() {
            self.update_retrying(tenant_id, parent_id, |task| {
                if task.status.is_terminal() {
                    return Ok(());
                }
                task.status = TaskStatus::Failed;
                task.error = Some("all subtasks failed".to_string());
                task.completed_at = Some(chrono::Utc::now());
                Ok(())
            })
            .await?;
            return Ok(());
        }

        let result = aggregate(&spec.aggregation, &self.reducers, &successes, &failed)?;
        self.update_retrying(tenant_id, parent_id, |task| {
            if task.status.is_terminal() {
                return Ok(());
            }
            task.status = TaskStatus::Completed;
            task.result = Some(result.clone());
            task.completed_at = Some(chrono::Utc::now());
            Ok(())
        })
        .await?;

        self.journal(
            &parent,
            "distributed_completed",
            "system",
            json!({ "succeeded": successes.len(), "failed": failed.len() }),
        )
        .await;
        self.sink.notify_agent(
            tenant_id,
            &parent.created_by,
            "task.completed",
            json!({ "task_id": parent_id }),
        );
        Ok(())
    }

    async fn cancel_children(&self, tenant_id: &str, children: &[Task]) {
        for child in children {
            if child.status.is_terminal() {
                continue;
            }
            let cancelled = self
                .update_retrying(tenant_id, child.id, |task| {
                    if task.status.is_terminal() {
                        return Ok(());
                    }
                    task.status = TaskStatus::Cancelled;
                    task.completed_at = Some(chrono::Utc::now());
                    Ok(())
                })
                .await;
            if let Err(err) = cancelled {
                warn!(%err, task_id = %child.id, "subtask cancel failed");
                continue;
            }
            if let Some(assignee) = &child.assigned_to {
                self.sink.notify_agent(
                    tenant_id,
                    assignee,
                    "task.cancelled",
                    json!({ "task_id": child.id, "reason": "sibling outcome" }),
                );
            }
        }
    }

    /// Soft-delete a task. Allowed for the creator or an admin principal;
    /// running tasks must be cancelled first.
    pub async fn delete(
        &self,
        tenant_id: &str,
        id: Uuid,
        by: &str,
        by_capabilities: &[String],
    ) -> Result<()> {
        let task = self.load(tenant_id, id).await?;
        let allowed = task.created_by == by || by_capabilities.iter().any(|c| c == "admin");
        if !allowed {
            return Err(MeshError::Forbidden(
                "only the creator or an admin may delete".into(),
            ));
        }
        if matches!(
            task.status,
            TaskStatus::Accepted | TaskStatus::InProgress
        ) {
            return Err(MeshError::Conflict(
                "cancel the task before deleting it".into(),
            ));
        }
        self.tasks.delete(tenant_id, id).await?;
        self.recorder
            .delete(tenant_id, "task", id, &task, by)
            .await;
        self.journal(&task, "task_deleted", by, json!({})).await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Retry bookkeeping and locks

    /// Atomically bump the retry count. The caller decides whether the new
    /// count still fits the budget.
    pub async fn increment_retry(&self, tenant_id: &str, id: Uuid) -> Result<u32> {
        let stored = self
            .update_retrying(tenant_id, id, |task| {
                if task.retry_count >= task.max_retries {
                    return Err(MeshError::Conflict(format!(
                        "retry budget of {} exhausted",
                        task.max_retries
                    )));
                }
                task.retry_count += 1;
                Ok(())
            })
            .await?;
        Ok(stored.retry_count)
    }

    /// Advisory lock preventing double dispatch. Expires on its own; a
    /// holder may re-acquire to extend.
    pub async fn lock_for_execution(
        &self,
        tenant_id: &str,
        id: Uuid,
        agent_id: &str,
        duration: Option<Duration>,
    ) -> Result<()> {
        // Confirm the task exists in this tenant before locking.
        self.load(tenant_id, id).await?;

        let duration = duration.unwrap_or(self.config.default_lock_duration);
        let mut locks = self.exec_locks.lock();
        let now = Instant::now();
        match locks.get(&id) {
            Some(lock) if lock.expires_at > now && lock.agent_id != agent_id => {
                Err(MeshError::Conflict(format!(
                    "task is locked by '{}'",
                    lock.agent_id
                )))
            }
            _ => {
                locks.insert(
                    id,
                    ExecutionLock {
                        agent_id: agent_id.to_string(),
                        expires_at: now + duration,
                    },
                );
                Ok(())
            }
        }
    }

    pub fn release_lock(&self, id: Uuid, agent_id: &str) {
        let mut locks = self.exec_locks.lock();
        if locks.get(&id).map(|l| l.agent_id == agent_id).unwrap_or(false) {
            locks.remove(&id);
        }
    }

    // ------------------------------------------------------------------
    // Selection

    /// Resolve an agent for unassigned work.
    pub async fn select_agent(
        &self,
        tenant_id: &str,
        policy: SelectionPolicy,
        criteria: &SelectionCriteria,
    ) -> Result<String> {
        let agents = self.agents.list(tenant_id).await?;
        self.selector.select(&agents, policy, criteria)
    }

    /// HLC clock shared with the rest of the runtime.
    pub fn clock(&self) -> &Arc<HybridLogicalClock> {
        &self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::RecordingSink;
    use mesh_core::models::AgentProfile;
    use mesh_core::oplog::OplogConfig;
    use mesh_storage::{
        MemoryAgentRepository, MemoryAuditRepository, MemoryTaskRepository,
    };

    struct Fixture {
        engine: TaskEngine,
        sink: Arc<RecordingSink>,
        agents: Arc<MemoryAgentRepository>,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(HybridLogicalClock::with_default_drift("n1"));
        let tasks = Arc::new(MemoryTaskRepository::new());
        let agents = Arc::new(MemoryAgentRepository::new());
        let audit = Arc::new(MemoryAuditRepository::new());
        let sink = Arc::new(RecordingSink::default());
        let engine = TaskEngine::new(
            tasks,
            agents.clone(),
            OperationLog::new(clock.clone(), OplogConfig::default()),
            AuditRecorder::new(audit),
            sink.clone(),
            clock,
            ReducerRegistry::new(),
            TaskEngineConfig::default(),
        );

        for id in ["agent-a", "agent-b", "agent-c", "agent-d"] {
            agents
                .register(AgentProfile::new(id, "t1").with_capabilities(vec!["review".into()]))
                .await
                .unwrap();
        }
        Fixture {
            engine,
            sink,
            agents,
        }
    }

    #[tokio::test]
    async fn test_create_is_idempotent_under_key() {
        let fx = fixture().await;
        let mut new_task = NewTask::new("t1", "code_review", "agent-a");
        new_task.idempotency_key = Some("req-1".into());

        let first = fx.engine.create(new_task.clone()).await.unwrap();
        let second = fx.engine.create(new_task).await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_delegation_chain_with_depth_guard() {
        let fx = fixture().await;
        let mut new_task = NewTask::new("t1", "code_review", "agent-a");
        new_task.assigned_to = Some("agent-a".into());
        let task = fx.engine.create(new_task).await.unwrap();

        // A -> B, then B -> C.
        fx.engine
            .delegate(
                "t1",
                task.id,
                "agent-a",
                &[],
                "agent-b",
                "workload",
                DelegationKind::Manual,
                Fields::new(),
            )
            .await
            .unwrap();
        let after = fx
            .engine
            .delegate(
                "t1",
                task.id,
                "agent-b",
                &[],
                "agent-c",
                "expertise",
                DelegationKind::Manual,
                Fields::new(),
            )
            .await
            .unwrap();
        assert_eq!(after.assigned_to.as_deref(), Some("agent-c"));

        let history = fx.engine.delegations("t1", task.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].from_agent, "agent-a");
        assert_eq!(history[0].to_agent, "agent-b");
        assert_eq!(history[1].from_agent, "agent-b");
        assert_eq!(history[1].to_agent, "agent-c");

        // Notifications went to B then C.
        let sent = fx.sink.sent.lock();
        let delegated: Vec<&String> = sent
            .iter()
            .filter(|(_, method, _)| method == "task.delegated")
            .map(|(agent, _, _)| agent)
            .collect();
        assert_eq!(delegated, ["agent-b", "agent-c"]);
        drop(sent);

        // Third hop hits the depth limit of 3 after one more delegation.
        fx.engine
            .delegate(
                "t1",
                task.id,
                "agent-c",
                &[],
                "agent-d",
                "again",
                DelegationKind::Manual,
                Fields::new(),
            )
            .await
            .unwrap();
        let err = fx
            .engine
            .delegate(
                "t1",
                task.id,
                "agent-d",
                &[],
                "agent-a",
                "one too many",
                DelegationKind::Manual,
                Fields::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_delegation_requires_standing() {
        let fx = fixture().await;
        let mut new_task = NewTask::new("t1", "code_review", "agent-a");
        new_task.assigned_to = Some("agent-a".into());
        let task = fx.engine.create(new_task).await.unwrap();

        // agent-b is neither assignee nor creator.
        let err = fx
            .engine
            .delegate(
                "t1",
                task.id,
                "agent-b",
                &[],
                "agent-c",
                "sneaky",
                DelegationKind::Manual,
                Fields::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Forbidden(_)));

        // The delegate-any capability grants standing.
        fx.engine
            .delegate(
                "t1",
                task.id,
                "agent-b",
                &[CAP_DELEGATE_ANY.to_string()],
                "agent-c",
                "authorized",
                DelegationKind::Automatic,
                Fields::new(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_accept_is_exclusive() {
        let fx = fixture().await;
        let mut new_task = NewTask::new("t1", "code_review", "agent-a");
        new_task.assigned_to = Some("agent-a".into());
        let task = fx.engine.create(new_task).await.unwrap();

        fx.engine.accept("t1", task.id, "agent-a", None).await.unwrap();
        let err = fx
            .engine
            .accept("t1", task.id, "agent-a", None)
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Conflict(_)));

        // A non-assignee can never accept.
        let err = fx
            .engine
            .accept("t1", task.id, "agent-b", None)
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_complete_sets_result_and_timestamps() {
        let fx = fixture().await;
        let mut new_task = NewTask::new("t1", "code_review", "agent-b");
        new_task.assigned_to = Some("agent-a".into());
        let task = fx.engine.create(new_task).await.unwrap();

        fx.engine.accept("t1", task.id, "agent-a", None).await.unwrap();
        let mut result = Fields::new();
        result.insert("issues".into(), json!(3));
        let done = fx
            .engine
            .complete("t1", task.id, "agent-a", result)
            .await
            .unwrap();

        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result.as_ref().unwrap()["issues"], 3);
        assert!(done.completed_at.is_some());
        assert!(done.started_at.is_some());

        // Creator was told.
        let sent = fx.sink.sent.lock();
        assert!(sent
            .iter()
            .any(|(agent, method, _)| agent == "agent-b" && method == "task.completed"));
    }

    #[tokio::test]
    async fn test_distributed_combine_with_partial_failure() {
        let fx = fixture().await;
        let subtask = |id: &str| SubtaskSpec {
            subtask_id: id.into(),
            task_type: "chunk".into(),
            parameters: Fields::new(),
            depends_on: vec![],
            assigned_to: Some("agent-a".into()),
            required_capabilities: vec![],
        };

        let (parent, children) = fx
            .engine
            .create_distributed(
                NewTask::new("t1", "fanout", "agent-a"),
                vec![subtask("s1"), subtask("s2"), subtask("s3")],
                AggregationPolicy::Combine,
                WaitPolicy::WaitForAll,
                FailurePolicy::ContinueOnFailure,
            )
            .await
            .unwrap();
        assert_eq!(children.len(), 3);

        let mut r1 = Fields::new();
        r1.insert("x".into(), json!(1));
        fx.engine
            .submit_subtask_result("t1", parent.id, "s1", r1)
            .await
            .unwrap();
        let mut r2 = Fields::new();
        r2.insert("y".into(), json!(2));
        fx.engine
            .submit_subtask_result("t1", parent.id, "s2", r2)
            .await
            .unwrap();

        // s3 fails; continue-on-failure still completes the parent.
        let s3 = children
            .iter()
            .find(|c| c.parameters["subtask_id"] == "s3")
            .unwrap();
        fx.engine
            .fail("t1", s3.id, "agent-a", "exploded")
            .await
            .unwrap();

        let parent = fx.engine.get("t1", parent.id).await.unwrap();
        assert_eq!(parent.status, TaskStatus::Completed);
        let result = parent.result.unwrap();
        assert_eq!(result["x"], 1);
        assert_eq!(result["y"], 2);
        assert_eq!(
            result[crate::distributed::PARTIAL_FAILURE_FIELD],
            json!(["s3"])
        );
    }

    #[tokio::test]
    async fn test_distributed_fail_fast_cancels_siblings() {
        let fx = fixture().await;
        let subtask = |id: &str| SubtaskSpec {
            subtask_id: id.into(),
            task_type: "chunk".into(),
            parameters: Fields::new(),
            depends_on: vec![],
            assigned_to: Some("agent-a".into()),
            required_capabilities: vec![],
        };

        let (parent, children) = fx
            .engine
            .create_distributed(
                NewTask::new("t1", "fanout", "agent-a"),
                vec![subtask("s1"), subtask("s2"), subtask("s3")],
                AggregationPolicy::Combine,
                WaitPolicy::WaitForAll,
                FailurePolicy::FailFast,
            )
            .await
            .unwrap();

        let s3 = children
            .iter()
            .find(|c| c.parameters["subtask_id"] == "s3")
            .unwrap();
        fx.engine
            .fail("t1", s3.id, "agent-a", "exploded")
            .await
            .unwrap();

        let parent = fx.engine.get("t1", parent.id).await.unwrap();
        assert_eq!(parent.status, TaskStatus::Failed);
        assert!(parent.error.unwrap().contains("s3"));

        // The healthy siblings received cancel signals.
        for name in ["s1", "s2"] {
            let child = children
                .iter()
                .find(|c| c.parameters["subtask_id"] == *name)
                .unwrap();
            let stored = fx.engine.get("t1", child.id).await.unwrap();
            assert_eq!(stored.status, TaskStatus::Cancelled);
        }
    }

    #[tokio::test]
    async fn test_distributed_rejects_cyclic_subtasks() {
        let fx = fixture().await;
        let subtask = |id: &str, deps: &[&str]| SubtaskSpec {
            subtask_id: id.into(),
            task_type: "chunk".into(),
            parameters: Fields::new(),
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            assigned_to: None,
            required_capabilities: vec![],
        };

        let err = fx
            .engine
            .create_distributed(
                NewTask::new("t1", "fanout", "agent-a"),
                vec![subtask("s1", &["s2"]), subtask("s2", &["s1"])],
                AggregationPolicy::Combine,
                WaitPolicy::WaitForAll,
                FailurePolicy::ContinueOnFailure,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Validation(_)));
    }

    #[tokio::test]
    async fn test_increment_retry_respects_budget() {
        let fx = fixture().await;
        let mut new_task = NewTask::new("t1", "flaky", "agent-a");
        new_task.max_retries = 2;
        let task = fx.engine.create(new_task).await.unwrap();

        assert_eq!(fx.engine.increment_retry("t1", task.id).await.unwrap(), 1);
        assert_eq!(fx.engine.increment_retry("t1", task.id).await.unwrap(), 2);
        let err = fx.engine.increment_retry("t1", task.id).await.unwrap_err();
        assert!(matches!(err, MeshError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_execution_lock_blocks_other_agents() {
        let fx = fixture().await;
        let task = fx
            .engine
            .create(NewTask::new("t1", "work", "agent-a"))
            .await
            .unwrap();

        fx.engine
            .lock_for_execution("t1", task.id, "agent-a", None)
            .await
            .unwrap();
        // Holder may extend, another agent may not take it.
        fx.engine
            .lock_for_execution("t1", task.id, "agent-a", None)
            .await
            .unwrap();
        let err = fx
            .engine
            .lock_for_execution("t1", task.id, "agent-b", None)
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Conflict(_)));

        fx.engine.release_lock(task.id, "agent-a");
        fx.engine
            .lock_for_execution("t1", task.id, "agent-b", None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_tenant_isolation_on_reads() {
        let fx = fixture().await;
        let task = fx
            .engine
            .create(NewTask::new("t1", "secret", "agent-a"))
            .await
            .unwrap();
        let err = fx.engine.get("t2", task.id).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_assign_rejects_offline_agent() {
        let fx = fixture().await;
        fx.agents
            .set_status("t1", "agent-b", AgentStatus::Offline)
            .await
            .unwrap();
        let task = fx
            .engine
            .create(NewTask::new("t1", "work", "agent-a"))
            .await
            .unwrap();
        let err = fx
            .engine
            .assign("t1", task.id, "agent-b", "agent-a")
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Conflict(_)));
    }
}
