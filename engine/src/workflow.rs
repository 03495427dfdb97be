//! Workflow execution.
//!
//! An execution walks its workflow's step DAG: steps whose dependencies
//! are satisfied get a task dispatched to the agent their role resolves
//! to, step completions copy outputs into the execution context, and the
//! failure policy of each step decides how much of the graph survives a
//! bad day. A background sweep enforces the global timeout so every
//! execution terminates.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use serde_json::{json, Value};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use mesh_core::error::{MeshError, Result};
use mesh_core::models::{
    ExecutionStatus, Fields, NewTask, OnFailure, RoleSelector, StepState, TaskStatus, Workflow,
    WorkflowExecution, WorkflowKind, WorkflowStep,
};
use mesh_core::repository::WorkflowRepository;
use mesh_core::validation;

use crate::notify::NotificationSink;
use crate::recorder::AuditRecorder;
use crate::selection::{SelectionCriteria, SelectionPolicy};
use crate::tasks::TaskEngine;

fn workflow_topic(id: Uuid) -> String {
    format!("workflow:{id}")
}

/// Drives workflow executions to termination.
pub struct WorkflowExecutor {
    workflows: Arc<dyn WorkflowRepository>,
    tasks: Arc<TaskEngine>,
    sink: Arc<dyn NotificationSink>,
    recorder: AuditRecorder,
    /// Serializes advancement per execution
    gates: SyncMutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
    /// Executions this node is responsible for timing out
    live: SyncMutex<HashSet<(String, Uuid)>>,
}

impl WorkflowExecutor {
    pub fn new(
        workflows: Arc<dyn WorkflowRepository>,
        tasks: Arc<TaskEngine>,
        sink: Arc<dyn NotificationSink>,
        recorder: AuditRecorder,
    ) -> Arc<Self> {
        Arc::new(Self {
            workflows,
            tasks,
            sink,
            recorder,
            gates: SyncMutex::new(HashMap::new()),
            live: SyncMutex::new(HashSet::new()),
        })
    }

    fn gate(&self, execution_id: Uuid) -> Arc<AsyncMutex<()>> {
        self.gates
            .lock()
            .entry(execution_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    // ------------------------------------------------------------------
    // Templates

    pub async fn create_workflow(&self, workflow: Workflow) -> Result<Workflow> {
        validation::validate_workflow(&workflow)?;
        let stored = self.workflows.create(workflow).await?;
        self.recorder
            .insert(&stored.tenant_id, "workflow", stored.id, &stored, "system")
            .await;
        info!(workflow_id = %stored.id, name = %stored.name, "workflow created");
        Ok(stored)
    }

    pub async fn get_workflow(&self, tenant_id: &str, id: Uuid) -> Result<Workflow> {
        self.workflows
            .get(tenant_id, id)
            .await?
            .ok_or_else(|| MeshError::not_found("workflow", id))
    }

    // ------------------------------------------------------------------
    // Execution lifecycle

    /// Start a new execution and dispatch its initial ready set.
    pub async fn execute(
        &self,
        tenant_id: &str,
        workflow_id: Uuid,
        trigger: &str,
        inputs: Fields,
    ) -> Result<WorkflowExecution> {
        let workflow = self.get_workflow(tenant_id, workflow_id).await?;
        if !workflow.active {
            return Err(MeshError::Conflict(format!(
                "workflow '{}' is inactive",
                workflow.name
            )));
        }

        let mut execution = WorkflowExecution::new(&workflow, trigger, inputs.clone());
        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(chrono::Utc::now());
        // Seed the context with the inputs so guards and references see them.
        for (key, value) in &inputs {
            execution.context.insert(key.clone(), value.clone());
        }
        let execution = self.workflows.create_execution(execution).await?;
        self.live
            .lock()
            .insert((tenant_id.to_string(), execution.id));

        self.recorder
            .insert(tenant_id, "workflow_execution", execution.id, &execution, trigger)
            .await;
        if workflow.kind == WorkflowKind::Collaborative {
            self.sink.broadcast(
                &workflow_topic(workflow.id),
                "workflow.started",
                json!({ "execution_id": execution.id, "workflow": workflow.name }),
            );
        }

        self.advance(tenant_id, execution.id).await?;
        self.get_execution(tenant_id, execution.id).await
    }

    pub async fn get_execution(&self, tenant_id: &str, id: Uuid) -> Result<WorkflowExecution> {
        self.workflows
            .get_execution(tenant_id, id)
            .await?
            .ok_or_else(|| MeshError::not_found("execution", id))
    }

    pub async fn pause(&self, tenant_id: &str, id: Uuid) -> Result<WorkflowExecution> {
        let _guard = self.gate(id).lock_owned().await;
        let execution = self.get_execution(tenant_id, id).await?;
        if execution.status != ExecutionStatus::Running {
            return Err(MeshError::Conflict(format!(
                "execution is {:?}, not running",
                execution.status
            )));
        }
        let expected = execution.version;
        let mut updated = execution;
        updated.status = ExecutionStatus::Paused;
        self.workflows.update_execution(updated, expected).await
    }

    pub async fn resume(&self, tenant_id: &str, id: Uuid) -> Result<WorkflowExecution> {
        {
            let _guard = self.gate(id).lock_owned().await;
            let execution = self.get_execution(tenant_id, id).await?;
            if execution.status != ExecutionStatus::Paused {
                return Err(MeshError::Conflict("execution is not paused".into()));
            }
            let expected = execution.version;
            let mut updated = execution;
            updated.status = ExecutionStatus::Running;
            self.workflows.update_execution(updated, expected).await?;
        }
        self.advance(tenant_id, id).await?;
        self.get_execution(tenant_id, id).await
    }

    pub async fn cancel(&self, tenant_id: &str, id: Uuid, reason: &str) -> Result<WorkflowExecution> {
        let _guard = self.gate(id).lock_owned().await;
        let execution = self.get_execution(tenant_id, id).await?;
        if execution.status.is_terminal() {
            return Err(MeshError::Conflict("execution already finished".into()));
        }
        self.cancel_running_tasks(tenant_id, &execution).await;

        let expected = execution.version;
        let mut updated = execution;
        updated.status = ExecutionStatus::Cancelled;
        updated.error = Some(reason.to_string());
        updated.finished_at = Some(chrono::Utc::now());
        let stored = self.workflows.update_execution(updated, expected).await?;
        self.live.lock().remove(&(tenant_id.to_string(), id));
        Ok(stored)
    }

    /// Record a step's result and push the execution forward. Called by
    /// the agent that finished the step's task.
    pub async fn complete_step(
        &self,
        tenant_id: &str,
        execution_id: Uuid,
        step_id: &str,
        agent_id: &str,
        result: Fields,
    ) -> Result<WorkflowExecution> {
        {
            let _guard = self.gate(execution_id).lock_owned().await;
            let execution = self.get_execution(tenant_id, execution_id).await?;
            if execution.status != ExecutionStatus::Running {
                return Err(MeshError::Conflict(format!(
                    "execution is {:?}, not running",
                    execution.status
                )));
            }
            if execution.step_states.get(step_id) != Some(&StepState::Running) {
                return Err(MeshError::Conflict(format!(
                    "step '{step_id}' is not running"
                )));
            }

            let workflow = self.get_workflow(tenant_id, execution.workflow_id).await?;
            let step = workflow
                .step(step_id)
                .ok_or_else(|| MeshError::not_found("step", step_id))?;

            // Best-effort completion of the underlying task.
            if let Some(task_id) = execution.step_tasks.get(step_id).copied() {
                if let Ok(task) = self.tasks.get(tenant_id, task_id).await {
                    if !task.status.is_terminal() && task.is_assigned_to(agent_id) {
                        if task.status == TaskStatus::Assigned {
                            let _ = self.tasks.accept(tenant_id, task_id, agent_id, None).await;
                        }
                        let _ = self
                            .tasks
                            .complete(tenant_id, task_id, agent_id, result.clone())
                            .await;
                    }
                }
            }

            let expected = execution.version;
            let mut updated = execution;
            updated.step_states
                .insert(step_id.to_string(), StepState::Completed);
            updated
                .step_results
                .insert(step_id.to_string(), result.clone());
            for (result_field, context_field) in &step.output_mapping {
                if let Some(value) = result.get(result_field) {
                    updated
                        .context
                        .insert(context_field.clone(), value.clone());
                }
            }
            self.workflows.update_execution(updated, expected).await?;
        }

        self.advance(tenant_id, execution_id).await?;
        self.get_execution(tenant_id, execution_id).await
    }

    /// Record a step failure and apply its on-failure policy.
    pub async fn fail_step(
        &self,
        tenant_id: &str,
        execution_id: Uuid,
        step_id: &str,
        error: &str,
    ) -> Result<WorkflowExecution> {
        {
            let _guard = self.gate(execution_id).lock_owned().await;
            let execution = self.get_execution(tenant_id, execution_id).await?;
            if execution.step_states.get(step_id) != Some(&StepState::Running) {
                return Err(MeshError::Conflict(format!(
                    "step '{step_id}' is not running"
                )));
            }
            let workflow = self.get_workflow(tenant_id, execution.workflow_id).await?;
            let step = workflow
                .step(step_id)
                .ok_or_else(|| MeshError::not_found("step", step_id))?;

            let expected = execution.version;
            let mut updated = execution;
            match step.on_failure {
                OnFailure::Retry
                    if updated.step_retries.get(step_id).copied().unwrap_or(0) > 0 =>
                {
                    let budget = updated.step_retries.get_mut(step_id);
                    if let Some(budget) = budget {
                        *budget -= 1;
                    }
                    updated
                        .step_states
                        .insert(step_id.to_string(), StepState::Pending);
                    updated.step_tasks.remove(step_id);
                    debug!(step_id, error, "step retry scheduled");
                }
                OnFailure::Skip => {
                    updated
                        .step_states
                        .insert(step_id.to_string(), StepState::Skipped);
                }
                OnFailure::Continue => {
                    updated
                        .step_states
                        .insert(step_id.to_string(), StepState::Failed);
                }
                // Fail, or Retry with an empty budget.
                _ => {
                    updated
                        .step_states
                        .insert(step_id.to_string(), StepState::Failed);
                    updated.status = ExecutionStatus::Failed;
                    updated.error = Some(format!("step '{step_id}' failed: {error}"));
                    updated.finished_at = Some(chrono::Utc::now());
                }
            }
            let is_terminal = updated.status.is_terminal();
            let snapshot = updated.clone();
            self.workflows.update_execution(updated, expected).await?;
            if is_terminal {
                self.cancel_running_tasks(tenant_id, &snapshot).await;
                self.live
                    .lock()
                    .remove(&(tenant_id.to_string(), execution_id));
                return self.get_execution(tenant_id, execution_id).await;
            }
        }

        self.advance(tenant_id, execution_id).await?;
        self.get_execution(tenant_id, execution_id).await
    }

    // ------------------------------------------------------------------
    // DAG advancement

    /// Dispatch every step whose dependencies are satisfied, then settle
    /// the execution status if the graph is exhausted.
    pub async fn advance(&self, tenant_id: &str, execution_id: Uuid) -> Result<()> {
        let _guard = self.gate(execution_id).lock_owned().await;
        loop {
            let execution = self.get_execution(tenant_id, execution_id).await?;
            if execution.status != ExecutionStatus::Running {
                return Ok(());
            }
            let workflow = self.get_workflow(tenant_id, execution.workflow_id).await?;

            if self.timed_out(&workflow, &execution) {
                self.mark_timed_out(tenant_id, execution).await?;
                return Ok(());
            }

            let ready = self.ready_steps(&workflow, &execution);
            if ready.is_empty() {
                if execution.all_steps_terminal() {
                    self.settle(tenant_id, execution).await?;
                }
                return Ok(());
            }

            let running = execution
                .step_states
                .values()
                .filter(|s| **s == StepState::Running)
                .count();
            let capacity = match workflow.kind {
                WorkflowKind::Sequential => 1usize.saturating_sub(running),
                WorkflowKind::Parallel | WorkflowKind::Collaborative => workflow
                    .max_parallel
                    .unwrap_or(usize::MAX)
                    .saturating_sub(running),
                WorkflowKind::Conditional => usize::MAX,
            };
            if capacity == 0 {
                return Ok(());
            }

            let mut dispatched_any = false;
            let expected = execution.version;
            let mut updated = execution;
            for step_id in ready.into_iter().take(capacity) {
                let step = match workflow.step(&step_id) {
                    Some(s) => s.clone(),
                    None => continue,
                };

                // Guards decide between dispatch and a vacuous skip.
                if !step.guards.iter().all(|g| g.evaluate(&updated.context)) {
                    updated
                        .step_states
                        .insert(step_id.clone(), StepState::Skipped);
                    debug!(step_id, "step skipped by guard");
                    dispatched_any = true;
                    continue;
                }

                match self.dispatch_step(tenant_id, &workflow, &mut updated, &step).await {
                    Ok(()) => dispatched_any = true,
                    Err(err) => {
                        warn!(%err, step_id = %step.step_id, "step dispatch failed");
                        updated
                            .step_states
                            .insert(step.step_id.clone(), StepState::Failed);
                        updated.status = ExecutionStatus::Failed;
                        updated.error = Some(format!(
                            "step '{}' could not be dispatched: {err}",
                            step.step_id
                        ));
                        updated.finished_at = Some(chrono::Utc::now());
                        dispatched_any = true;
                        break;
                    }
                }
            }

            if !dispatched_any {
                return Ok(());
            }
            let still_running = !updated.status.is_terminal();
            self.workflows.update_execution(updated, expected).await?;
            if !still_running {
                self.live
                    .lock()
                    .remove(&(tenant_id.to_string(), execution_id));
                return Ok(());
            }
            // Loop again: skips may have unblocked dependents.
        }
    }

    /// Steps whose predecessors all unblock them, in deterministic order.
    fn ready_steps(&self, workflow: &Workflow, execution: &WorkflowExecution) -> Vec<String> {
        let satisfied: BTreeSet<String> = workflow
            .steps
            .iter()
            .filter(|step| {
                let state = execution
                    .step_states
                    .get(&step.step_id)
                    .copied()
                    .unwrap_or(StepState::Pending);
                state.unblocks_dependents()
                    || (state == StepState::Failed
                        && matches!(step.on_failure, OnFailure::Continue | OnFailure::Skip))
            })
            .map(|step| step.step_id.clone())
            .collect();

        let mut ready: Vec<String> = workflow
            .steps
            .iter()
            .filter(|step| {
                execution
                    .step_states
                    .get(&step.step_id)
                    .copied()
                    .unwrap_or(StepState::Pending)
                    == StepState::Pending
                    && step.depends_on.iter().all(|d| satisfied.contains(d))
            })
            .map(|step| step.step_id.clone())
            .collect();

        // Keep declaration order for sequential determinism.
        let position: HashMap<&str, usize> = workflow
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.step_id.as_str(), i))
            .collect();
        ready.sort_by_key(|id| position.get(id.as_str()).copied().unwrap_or(usize::MAX));
        ready
    }

    /// Create and assign the task backing one step.
    async fn dispatch_step(
        &self,
        tenant_id: &str,
        workflow: &Workflow,
        execution: &mut WorkflowExecution,
        step: &WorkflowStep,
    ) -> Result<()> {
        let agent_id = self.resolve_role(tenant_id, workflow, &step.role).await?;
        let parameters = resolve_input(&step.input, execution);

        let mut new_task = NewTask::new(tenant_id, &step.action, &execution.trigger);
        new_task.assigned_to = Some(agent_id.clone());
        new_task.parameters = parameters;
        new_task
            .parameters
            .insert("execution_id".to_string(), json!(execution.id));
        new_task
            .parameters
            .insert("step_id".to_string(), json!(step.step_id));
        if let Some(timeout) = step.timeout_secs {
            new_task.timeout_secs = timeout;
        }
        let task = self.tasks.create(new_task).await?;

        execution
            .step_states
            .insert(step.step_id.clone(), StepState::Running);
        execution.step_tasks.insert(step.step_id.clone(), task.id);
        execution.cursor = Some(step.step_id.clone());

        if workflow.kind == WorkflowKind::Collaborative {
            self.sink.broadcast(
                &workflow_topic(workflow.id),
                "workflow.step_started",
                json!({ "execution_id": execution.id, "step_id": step.step_id, "agent": agent_id }),
            );
        }
        debug!(step_id = %step.step_id, agent = %agent_id, "step dispatched");
        Ok(())
    }

    async fn resolve_role(
        &self,
        tenant_id: &str,
        workflow: &Workflow,
        role: &str,
    ) -> Result<String> {
        let selector = workflow
            .roles
            .get(role)
            .ok_or_else(|| MeshError::Validation(format!("undeclared role '{role}'")))?;
        match selector {
            RoleSelector::Specific(agent_id) => Ok(agent_id.clone()),
            RoleSelector::Capability(capabilities) => {
                let criteria = SelectionCriteria {
                    required_capabilities: capabilities.clone(),
                    ..Default::default()
                };
                self.tasks
                    .select_agent(tenant_id, SelectionPolicy::LeastLoaded, &criteria)
                    .await
            }
            RoleSelector::Any => {
                self.tasks
                    .select_agent(tenant_id, SelectionPolicy::LeastLoaded, &Default::default())
                    .await
            }
        }
    }

    fn timed_out(&self, workflow: &Workflow, execution: &WorkflowExecution) -> bool {
        match (workflow.global_timeout_secs, execution.started_at) {
            (Some(limit), Some(started)) => {
                let elapsed = chrono::Utc::now() - started;
                elapsed.num_seconds() >= 0 && elapsed.num_seconds() as u64 >= limit
            }
            _ => false,
        }
    }

    async fn mark_timed_out(&self, tenant_id: &str, execution: WorkflowExecution) -> Result<()> {
        self.cancel_running_tasks(tenant_id, &execution).await;
        let id = execution.id;
        let expected = execution.version;
        let mut updated = execution;
        updated.status = ExecutionStatus::Timeout;
        updated.error = Some("global timeout exceeded".to_string());
        updated.finished_at = Some(chrono::Utc::now());
        self.workflows.update_execution(updated, expected).await?;
        self.live.lock().remove(&(tenant_id.to_string(), id));
        warn!(execution_id = %id, "execution timed out");
        Ok(())
    }

    /// Every step terminal: settle the final status.
    async fn settle(&self, tenant_id: &str, execution: WorkflowExecution) -> Result<()> {
        let id = execution.id;
        let failed = execution.any_step_failed();
        let expected = execution.version;
        let mut updated = execution;
        updated.status = if failed {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        };
        if failed && updated.error.is_none() {
            updated.error = Some("one or more steps failed".to_string());
        }
        updated.finished_at = Some(chrono::Utc::now());
        let stored = self.workflows.update_execution(updated, expected).await?;
        self.live.lock().remove(&(tenant_id.to_string(), id));

        self.recorder
            .update(tenant_id, "workflow_execution", id, &stored, &stored, "system")
            .await;
        info!(execution_id = %id, status = ?stored.status, "execution settled");
        Ok(())
    }

    async fn cancel_running_tasks(&self, tenant_id: &str, execution: &WorkflowExecution) {
        for (step_id, task_id) in &execution.step_tasks {
            if execution.step_states.get(step_id) == Some(&StepState::Running) {
                if let Err(err) = self
                    .tasks
                    .cancel(tenant_id, *task_id, "system", "execution ended")
                    .await
                {
                    debug!(%err, step_id, "step task cancel skipped");
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Timeout sweep

    /// Spawn the periodic sweep that forces timed-out executions into the
    /// timeout state even when no step event ever arrives.
    pub fn spawn_timeout_sweep(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let executor = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => executor.sweep_timeouts().await,
                }
            }
            debug!("workflow timeout sweep stopped");
        })
    }

    async fn sweep_timeouts(&self) {
        let live: Vec<(String, Uuid)> = self.live.lock().iter().cloned().collect();
        for (tenant_id, execution_id) in live {
            let _guard = self.gate(execution_id).lock_owned().await;
            let execution = match self.workflows.get_execution(&tenant_id, execution_id).await {
                Ok(Some(e)) if e.status == ExecutionStatus::Running => e,
                Ok(Some(e)) if e.status.is_terminal() => {
                    self.live.lock().remove(&(tenant_id.clone(), execution_id));
                    continue;
                }
                _ => continue,
            };
            let workflow = match self.workflows.get(&tenant_id, execution.workflow_id).await {
                Ok(Some(w)) => w,
                _ => continue,
            };
            if self.timed_out(&workflow, &execution) {
                if let Err(err) = self.mark_timed_out(&tenant_id, execution).await {
                    warn!(%err, %execution_id, "timeout sweep failed");
                }
            }
        }
    }
}

/// Resolve a step's literal input map against the execution. String values
/// of the form `$step.output`, `$step.output.field`, `$input.field`, or
/// `$context.field` are replaced; everything else passes through.
fn resolve_input(input: &Fields, execution: &WorkflowExecution) -> Fields {
    let mut out = Fields::new();
    for (key, value) in input {
        out.insert(key.clone(), resolve_value(value, execution));
    }
    out
}

fn resolve_value(value: &Value, execution: &WorkflowExecution) -> Value {
    let reference = match value.as_str() {
        Some(s) if s.starts_with('$') => &s[1..],
        _ => return value.clone(),
    };
    let mut parts = reference.splitn(3, '.');
    let head = parts.next().unwrap_or_default();
    let section = parts.next();
    let field = parts.next();

    match (head, section) {
        ("input", None) => Value::Object(execution.inputs.clone()),
        ("input", Some(field)) => execution.inputs.get(field).cloned().unwrap_or(Value::Null),
        ("context", None) => Value::Object(execution.context.clone()),
        ("context", Some(field)) => execution.context.get(field).cloned().unwrap_or(Value::Null),
        (step, Some("output")) => {
            let result = execution.step_results.get(step);
            match (result, field) {
                (Some(fields), None) => Value::Object(fields.clone()),
                (Some(fields), Some(name)) => fields.get(name).cloned().unwrap_or(Value::Null),
                (None, _) => Value::Null,
            }
        }
        _ => Value::Null,
    }
}
