//! Method table.
//!
//! Binds the wire namespace to the engine services. Every method is a
//! descriptor naming its required capabilities, timeout, and rate bucket;
//! the dispatch pipeline applies the middleware around the closures
//! registered here.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use mesh_core::error::{MeshError, Result};
use mesh_core::repository::{AgentRepository, TaskRepository};
use mesh_core::models::{
    AgentProfile, AggregationPolicy, ContentType, DelegationKind, DocOpKind, FailurePolicy,
    Fields, MemberRole, NewTask, SubtaskSpec, TaskFilter, TaskPriority, Visibility, WaitPolicy,
    Workflow, WorkflowKind, WorkflowStep,
};
use mesh_protocol::notifier::{document_topic, workflow_topic, workspace_topic};
use mesh_protocol::pipeline::{handler_fn, Dispatcher, HandlerDescriptor, RequestContext};
use mesh_protocol::session::SessionState;

use crate::runtime::AppState;

/// Read-side capability scope.
pub const SCOPE_READ: &str = "mesh:read";
/// Write-side capability scope.
pub const SCOPE_WRITE: &str = "mesh:write";

fn parse<T: DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| MeshError::InvalidParams(e.to_string()))
}

fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| MeshError::Internal(format!("encode failed: {e}")))
}

/// Build the complete dispatcher for one server instance.
pub fn build_dispatcher(state: Arc<AppState>) -> Dispatcher {
    let mut dispatcher = Dispatcher::new();
    let timeout = state.config.handler_timeout();

    // Clock drift beyond the bound puts the node into read-only mode
    // until a peer sync lands back inside it.
    {
        let clock = state.clock.clone();
        dispatcher.set_read_only_gate(Arc::new(move || clock.is_degraded()));
    }

    let descriptor = |method: &str,
                      caps: &[&str],
                      handler: Arc<dyn mesh_protocol::pipeline::Handler>|
     -> HandlerDescriptor {
        let mut d = HandlerDescriptor::new(method, handler).with_timeout(timeout);
        for cap in caps {
            d = d.requires(*cap);
            if *cap == SCOPE_WRITE {
                d = d.mutating();
            }
        }
        d
    };

    // ------------------------------------------------------------ session

    dispatcher.register(descriptor(
        "initialize",
        &[],
        handler_fn(|_ctx, _params| async move {
            Err::<Value, _>(MeshError::Conflict("session already initialized".into()))
        }),
    ));

    dispatcher.register(descriptor(
        "disconnect",
        &[],
        handler_fn(|ctx: RequestContext, _params| async move {
            ctx.session.transition_to(SessionState::Closing)?;
            Ok(json!({ "ok": true }))
        }),
    ));

    {
        let state = state.clone();
        dispatcher.register(descriptor(
            "ping",
            &[],
            handler_fn(move |ctx: RequestContext, _params| {
                let state = state.clone();
                async move {
                    ctx.session.record_pong();
                    state.repos.tasks.health_check().await?;
                    state.repos.agents.health_check().await?;
                    Ok(json!({
                        "status": "healthy",
                        "version": env!("CARGO_PKG_VERSION"),
                        "uptime_secs": state.started_at.elapsed().as_secs(),
                        "node_id": state.config.node.id,
                        "timestamp": chrono::Utc::now(),
                        "sessions": state.pool.stats().total_sessions,
                        "degraded": state.clock.is_degraded(),
                    }))
                }
            }),
        ));
    }

    // ------------------------------------------------------------- agents

    {
        #[derive(Deserialize)]
        struct RegisterParams {
            #[serde(default)]
            capabilities: Vec<String>,
        }
        let state = state.clone();
        dispatcher.register(descriptor(
            "agent.register",
            &[],
            handler_fn(move |ctx: RequestContext, params| {
                let state = state.clone();
                async move {
                    let params: RegisterParams = parse(params)?;
                    mesh_core::validation::validate_agent_id(&ctx.principal.agent_id)?;
                    let profile =
                        AgentProfile::new(&ctx.principal.agent_id, &ctx.principal.tenant_id)
                            .with_capabilities(params.capabilities);
                    let stored = state.repos.agents.register(profile).await?;
                    to_value(&stored)
                }
            }),
        ));
    }

    // -------------------------------------------------------------- tasks

    {
        #[derive(Deserialize)]
        struct CreateTaskParams {
            task_type: String,
            #[serde(default)]
            priority: TaskPriority,
            assigned_to: Option<String>,
            parent_id: Option<Uuid>,
            #[serde(default)]
            depends_on: Vec<Uuid>,
            #[serde(default)]
            parameters: Fields,
            max_retries: Option<u32>,
            timeout_secs: Option<u64>,
            idempotency_key: Option<String>,
        }
        let state = state.clone();
        dispatcher.register(descriptor(
            "task.create",
            &[SCOPE_WRITE],
            handler_fn(move |ctx: RequestContext, params| {
                let state = state.clone();
                async move {
                    let params: CreateTaskParams = parse(params)?;
                    let mut new_task = NewTask::new(
                        &ctx.principal.tenant_id,
                        params.task_type,
                        &ctx.principal.agent_id,
                    );
                    new_task.priority = params.priority;
                    new_task.assigned_to = params.assigned_to;
                    new_task.parent_id = params.parent_id;
                    new_task.depends_on = params.depends_on;
                    new_task.parameters = params.parameters;
                    if let Some(max_retries) = params.max_retries {
                        new_task.max_retries = max_retries;
                    }
                    if let Some(timeout_secs) = params.timeout_secs {
                        new_task.timeout_secs = timeout_secs;
                    }
                    new_task.idempotency_key = params.idempotency_key;
                    let task = state.tasks.create(new_task).await?;
                    to_value(&task)
                }
            }),
        ));
    }

    {
        #[derive(Deserialize)]
        struct GetTaskParams {
            task_id: Uuid,
        }
        let state = state.clone();
        dispatcher.register(descriptor(
            "task.get",
            &[SCOPE_READ],
            handler_fn(move |ctx: RequestContext, params| {
                let state = state.clone();
                async move {
                    let params: GetTaskParams = parse(params)?;
                    let task = state
                        .tasks
                        .get(&ctx.principal.tenant_id, params.task_id)
                        .await?;
                    let delegations = state
                        .tasks
                        .delegations(&ctx.principal.tenant_id, params.task_id)
                        .await?;
                    Ok(json!({ "task": task, "delegations": delegations }))
                }
            }),
        ));
    }

    {
        #[derive(Deserialize)]
        struct UpdateTaskParams {
            task_id: Uuid,
            expected_version: u64,
            priority: Option<TaskPriority>,
            #[serde(default)]
            parameters: Option<Fields>,
            timeout_secs: Option<u64>,
        }
        let state = state.clone();
        dispatcher.register(descriptor(
            "task.update",
            &[SCOPE_WRITE],
            handler_fn(move |ctx: RequestContext, params| {
                let state = state.clone();
                async move {
                    let params: UpdateTaskParams = parse(params)?;
                    let mut task = state
                        .tasks
                        .get(&ctx.principal.tenant_id, params.task_id)
                        .await?;
                    if let Some(priority) = params.priority {
                        task.priority = priority;
                    }
                    if let Some(parameters) = params.parameters {
                        for (key, value) in parameters {
                            task.parameters.insert(key, value);
                        }
                    }
                    if let Some(timeout_secs) = params.timeout_secs {
                        task.timeout_secs = timeout_secs;
                    }
                    let stored = state
                        .tasks
                        .update_with_version(task, params.expected_version)
                        .await?;
                    to_value(&stored)
                }
            }),
        ));
    }

    {
        #[derive(Deserialize)]
        struct DeleteTaskParams {
            task_id: Uuid,
        }
        let state = state.clone();
        dispatcher.register(descriptor(
            "task.delete",
            &[SCOPE_WRITE],
            handler_fn(move |ctx: RequestContext, params| {
                let state = state.clone();
                async move {
                    let params: DeleteTaskParams = parse(params)?;
                    state
                        .tasks
                        .delete(
                            &ctx.principal.tenant_id,
                            params.task_id,
                            &ctx.principal.agent_id,
                            &ctx.principal.capabilities,
                        )
                        .await?;
                    Ok(json!({ "deleted": true }))
                }
            }),
        ));
    }

    {
        #[derive(Deserialize)]
        struct DelegateParams {
            task_id: Uuid,
            to_agent: String,
            #[serde(default)]
            reason: String,
            #[serde(default = "default_delegation_kind")]
            delegation_type: DelegationKind,
            #[serde(default)]
            metadata: Fields,
        }
        fn default_delegation_kind() -> DelegationKind {
            DelegationKind::Manual
        }
        let state = state.clone();
        dispatcher.register(descriptor(
            "task.delegate",
            &[SCOPE_WRITE],
            handler_fn(move |ctx: RequestContext, params| {
                let state = state.clone();
                async move {
                    let params: DelegateParams = parse(params)?;
                    let task = state
                        .tasks
                        .delegate(
                            &ctx.principal.tenant_id,
                            params.task_id,
                            &ctx.principal.agent_id,
                            &ctx.principal.capabilities,
                            &params.to_agent,
                            &params.reason,
                            params.delegation_type,
                            params.metadata,
                        )
                        .await?;
                    to_value(&task)
                }
            }),
        ));
    }

    {
        #[derive(Deserialize)]
        struct AcceptParams {
            task_id: Uuid,
            estimated_duration_secs: Option<u64>,
        }
        let state = state.clone();
        dispatcher.register(descriptor(
            "task.accept",
            &[SCOPE_WRITE],
            handler_fn(move |ctx: RequestContext, params| {
                let state = state.clone();
                async move {
                    let params: AcceptParams = parse(params)?;
                    let task = state
                        .tasks
                        .accept(
                            &ctx.principal.tenant_id,
                            params.task_id,
                            &ctx.principal.agent_id,
                            params.estimated_duration_secs,
                        )
                        .await?;
                    to_value(&task)
                }
            }),
        ));
    }

    {
        #[derive(Deserialize)]
        struct CompleteParams {
            task_id: Uuid,
            #[serde(default)]
            result: Fields,
            error: Option<String>,
        }
        let state = state.clone();
        dispatcher.register(descriptor(
            "task.complete",
            &[SCOPE_WRITE],
            handler_fn(move |ctx: RequestContext, params| {
                let state = state.clone();
                async move {
                    let params: CompleteParams = parse(params)?;
                    let tenant = &ctx.principal.tenant_id;
                    let agent = &ctx.principal.agent_id;
                    let task = match params.error {
                        Some(error) => {
                            state
                                .tasks
                                .fail(tenant, params.task_id, agent, &error)
                                .await?
                        }
                        None => {
                            state
                                .tasks
                                .complete(tenant, params.task_id, agent, params.result)
                                .await?
                        }
                    };
                    to_value(&task)
                }
            }),
        ));
    }

    {
        #[derive(Deserialize)]
        struct CreateDistributedParams {
            task_type: String,
            subtasks: Vec<SubtaskSpec>,
            aggregation: AggregationPolicy,
            wait_policy: WaitPolicy,
            failure_policy: FailurePolicy,
            #[serde(default)]
            parameters: Fields,
            idempotency_key: Option<String>,
        }
        let state = state.clone();
        dispatcher.register(descriptor(
            "task.create_distributed",
            &[SCOPE_WRITE],
            handler_fn(move |ctx: RequestContext, params| {
                let state = state.clone();
                async move {
                    let params: CreateDistributedParams = parse(params)?;
                    let mut parent = NewTask::new(
                        &ctx.principal.tenant_id,
                        params.task_type,
                        &ctx.principal.agent_id,
                    );
                    parent.parameters = params.parameters;
                    parent.idempotency_key = params.idempotency_key;
                    let (parent, subtasks) = state
                        .tasks
                        .create_distributed(
                            parent,
                            params.subtasks,
                            params.aggregation,
                            params.wait_policy,
                            params.failure_policy,
                        )
                        .await?;
                    Ok(json!({ "parent": parent, "subtasks": subtasks }))
                }
            }),
        ));
    }

    {
        #[derive(Deserialize)]
        struct SubmitResultParams {
            parent_task_id: Uuid,
            subtask_id: String,
            #[serde(default)]
            result: Fields,
        }
        let state = state.clone();
        dispatcher.register(descriptor(
            "task.submit_result",
            &[SCOPE_WRITE],
            handler_fn(move |ctx: RequestContext, params| {
                let state = state.clone();
                async move {
                    let params: SubmitResultParams = parse(params)?;
                    let parent = state
                        .tasks
                        .submit_subtask_result(
                            &ctx.principal.tenant_id,
                            params.parent_task_id,
                            &params.subtask_id,
                            params.result,
                        )
                        .await?;
                    to_value(&parent)
                }
            }),
        ));
    }

    {
        let state = state.clone();
        dispatcher.register(descriptor(
            "task.list",
            &[SCOPE_READ],
            handler_fn(move |ctx: RequestContext, params| {
                let state = state.clone();
                async move {
                    let filter: TaskFilter = parse(params)?;
                    let tasks = state.tasks.list(&ctx.principal.tenant_id, filter).await?;
                    Ok(json!({ "tasks": tasks }))
                }
            }),
        ));
    }

    // ---------------------------------------------------------- workflows

    {
        #[derive(Deserialize)]
        struct CreateWorkflowParams {
            name: String,
            kind: WorkflowKind,
            roles: std::collections::HashMap<String, mesh_core::models::RoleSelector>,
            steps: Vec<WorkflowStep>,
            max_parallel: Option<usize>,
            global_timeout_secs: Option<u64>,
        }
        let build_workflow = |ctx: &RequestContext, params: CreateWorkflowParams, kind| Workflow {
            id: Uuid::new_v4(),
            tenant_id: ctx.principal.tenant_id.clone(),
            name: params.name,
            kind,
            version: 1,
            roles: params.roles,
            steps: params.steps,
            max_parallel: params.max_parallel,
            global_timeout_secs: params.global_timeout_secs,
            active: true,
            created_at: chrono::Utc::now(),
        };

        let state_create = state.clone();
        dispatcher.register(descriptor(
            "workflow.create",
            &[SCOPE_WRITE],
            handler_fn(move |ctx: RequestContext, params| {
                let state = state_create.clone();
                async move {
                    let params: CreateWorkflowParams = parse(params)?;
                    let kind = params.kind;
                    let workflow = build_workflow(&ctx, params, kind);
                    let stored = state.workflows.create_workflow(workflow).await?;
                    to_value(&stored)
                }
            }),
        ));

        let state_collab = state.clone();
        dispatcher.register(descriptor(
            "workflow.create_collaborative",
            &[SCOPE_WRITE],
            handler_fn(move |ctx: RequestContext, params| {
                let state = state_collab.clone();
                async move {
                    let params: CreateWorkflowParams = parse(params)?;
                    let workflow = build_workflow(&ctx, params, WorkflowKind::Collaborative);
                    let stored = state.workflows.create_workflow(workflow).await?;
                    to_value(&stored)
                }
            }),
        ));
    }

    {
        #[derive(Deserialize)]
        struct ExecuteParams {
            workflow_id: Uuid,
            #[serde(default)]
            inputs: Fields,
        }
        let state_exec = state.clone();
        dispatcher.register(descriptor(
            "workflow.execute",
            &[SCOPE_WRITE],
            handler_fn(move |ctx: RequestContext, params| {
                let state = state_exec.clone();
                async move {
                    let params: ExecuteParams = parse(params)?;
                    let execution = state
                        .workflows
                        .execute(
                            &ctx.principal.tenant_id,
                            params.workflow_id,
                            &ctx.principal.agent_id,
                            params.inputs,
                        )
                        .await?;
                    to_value(&execution)
                }
            }),
        ));

        let state_collab = state.clone();
        dispatcher.register(descriptor(
            "workflow.execute_collaborative",
            &[SCOPE_WRITE],
            handler_fn(move |ctx: RequestContext, params| {
                let state = state_collab.clone();
                async move {
                    let params: ExecuteParams = parse(params)?;
                    // The caller follows the run's broadcasts.
                    ctx.session.subscribe(workflow_topic(params.workflow_id));
                    let execution = state
                        .workflows
                        .execute(
                            &ctx.principal.tenant_id,
                            params.workflow_id,
                            &ctx.principal.agent_id,
                            params.inputs,
                        )
                        .await?;
                    to_value(&execution)
                }
            }),
        ));
    }

    {
        #[derive(Deserialize)]
        struct ExecutionParams {
            execution_id: Uuid,
            reason: Option<String>,
        }
        let state_status = state.clone();
        dispatcher.register(descriptor(
            "workflow.get_status",
            &[SCOPE_READ],
            handler_fn(move |ctx: RequestContext, params| {
                let state = state_status.clone();
                async move {
                    let params: ExecutionParams = parse(params)?;
                    let execution = state
                        .workflows
                        .get_execution(&ctx.principal.tenant_id, params.execution_id)
                        .await?;
                    to_value(&execution)
                }
            }),
        ));

        let state_pause = state.clone();
        dispatcher.register(descriptor(
            "workflow.pause",
            &[SCOPE_WRITE],
            handler_fn(move |ctx: RequestContext, params| {
                let state = state_pause.clone();
                async move {
                    let params: ExecutionParams = parse(params)?;
                    let execution = state
                        .workflows
                        .pause(&ctx.principal.tenant_id, params.execution_id)
                        .await?;
                    to_value(&execution)
                }
            }),
        ));

        let state_resume = state.clone();
        dispatcher.register(descriptor(
            "workflow.resume",
            &[SCOPE_WRITE],
            handler_fn(move |ctx: RequestContext, params| {
                let state = state_resume.clone();
                async move {
                    let params: ExecutionParams = parse(params)?;
                    let execution = state
                        .workflows
                        .resume(&ctx.principal.tenant_id, params.execution_id)
                        .await?;
                    to_value(&execution)
                }
            }),
        ));

        let state_cancel = state.clone();
        dispatcher.register(descriptor(
            "workflow.cancel",
            &[SCOPE_WRITE],
            handler_fn(move |ctx: RequestContext, params| {
                let state = state_cancel.clone();
                async move {
                    let params: ExecutionParams = parse(params)?;
                    let reason = params.reason.unwrap_or_else(|| "cancelled".to_string());
                    let execution = state
                        .workflows
                        .cancel(&ctx.principal.tenant_id, params.execution_id, &reason)
                        .await?;
                    to_value(&execution)
                }
            }),
        ));
    }

    {
        #[derive(Deserialize)]
        struct CompleteStepParams {
            execution_id: Uuid,
            step_id: String,
            #[serde(default)]
            result: Fields,
            error: Option<String>,
        }
        let state = state.clone();
        dispatcher.register(descriptor(
            "workflow.complete_task",
            &[SCOPE_WRITE],
            handler_fn(move |ctx: RequestContext, params| {
                let state = state.clone();
                async move {
                    let params: CompleteStepParams = parse(params)?;
                    let tenant = &ctx.principal.tenant_id;
                    let execution = match params.error {
                        Some(error) => {
                            state
                                .workflows
                                .fail_step(tenant, params.execution_id, &params.step_id, &error)
                                .await?
                        }
                        None => {
                            state
                                .workflows
                                .complete_step(
                                    tenant,
                                    params.execution_id,
                                    &params.step_id,
                                    &ctx.principal.agent_id,
                                    params.result,
                                )
                                .await?
                        }
                    };
                    to_value(&execution)
                }
            }),
        ));
    }

    // --------------------------------------------------------- workspaces

    {
        #[derive(Deserialize)]
        struct CreateWorkspaceParams {
            name: String,
            #[serde(default = "default_visibility")]
            visibility: Visibility,
            max_members: Option<u32>,
        }
        fn default_visibility() -> Visibility {
            Visibility::Team
        }
        let state = state.clone();
        dispatcher.register(descriptor(
            "workspace.create",
            &[SCOPE_WRITE],
            handler_fn(move |ctx: RequestContext, params| {
                let state = state.clone();
                async move {
                    let params: CreateWorkspaceParams = parse(params)?;
                    let workspace = state
                        .workspaces
                        .create(
                            &ctx.principal.tenant_id,
                            &params.name,
                            &ctx.principal.agent_id,
                            params.visibility,
                            params.max_members,
                        )
                        .await?;
                    ctx.session.subscribe(workspace_topic(workspace.id));
                    to_value(&workspace)
                }
            }),
        ));
    }

    {
        #[derive(Deserialize)]
        struct JoinParams {
            workspace_id: Uuid,
            #[serde(default = "default_member_role")]
            role: MemberRole,
        }
        fn default_member_role() -> MemberRole {
            MemberRole::Member
        }
        let state = state.clone();
        dispatcher.register(descriptor(
            "workspace.join",
            &[SCOPE_WRITE],
            handler_fn(move |ctx: RequestContext, params| {
                let state = state.clone();
                async move {
                    let params: JoinParams = parse(params)?;
                    let member = state
                        .workspaces
                        .join(
                            &ctx.principal.tenant_id,
                            params.workspace_id,
                            &ctx.principal.agent_id,
                            params.role,
                        )
                        .await?;
                    ctx.session.subscribe(workspace_topic(params.workspace_id));
                    to_value(&member)
                }
            }),
        ));
    }

    {
        #[derive(Deserialize)]
        struct LeaveParams {
            workspace_id: Uuid,
        }
        let state = state.clone();
        dispatcher.register(descriptor(
            "workspace.leave",
            &[SCOPE_WRITE],
            handler_fn(move |ctx: RequestContext, params| {
                let state = state.clone();
                async move {
                    let params: LeaveParams = parse(params)?;
                    state
                        .workspaces
                        .leave(
                            &ctx.principal.tenant_id,
                            params.workspace_id,
                            &ctx.principal.agent_id,
                        )
                        .await?;
                    ctx.session
                        .unsubscribe(&workspace_topic(params.workspace_id));
                    Ok(json!({ "left": true }))
                }
            }),
        ));
    }

    {
        #[derive(Deserialize)]
        struct UpdateStateParams {
            workspace_id: Uuid,
            updates: Fields,
            observed_version: u64,
            #[serde(default)]
            merge: bool,
        }
        let state = state.clone();
        dispatcher.register(descriptor(
            "workspace.update_state",
            &[SCOPE_WRITE],
            handler_fn(move |ctx: RequestContext, params| {
                let state = state.clone();
                async move {
                    let params: UpdateStateParams = parse(params)?;
                    let update = state
                        .workspaces
                        .update_state(
                            &ctx.principal.tenant_id,
                            params.workspace_id,
                            &ctx.principal.agent_id,
                            params.updates,
                            params.observed_version,
                            params.merge,
                        )
                        .await?;
                    Ok(json!({
                        "workspace": update.workspace,
                        "merged": update.merged,
                        "conflicts": update.conflicts,
                    }))
                }
            }),
        ));
    }

    {
        #[derive(Deserialize)]
        struct GetStateParams {
            workspace_id: Uuid,
        }
        let state = state.clone();
        dispatcher.register(descriptor(
            "workspace.get_state",
            &[SCOPE_READ],
            handler_fn(move |ctx: RequestContext, params| {
                let state = state.clone();
                async move {
                    let params: GetStateParams = parse(params)?;
                    let workspace = state
                        .workspaces
                        .get(&ctx.principal.tenant_id, params.workspace_id)
                        .await?;
                    Ok(json!({
                        "state": workspace.state,
                        "state_version": workspace.state_version,
                    }))
                }
            }),
        ));
    }

    // ---------------------------------------------------------- documents

    {
        #[derive(Deserialize)]
        struct CreateDocumentParams {
            workspace_id: Uuid,
            title: String,
            #[serde(default = "default_content_type")]
            content_type: ContentType,
        }
        fn default_content_type() -> ContentType {
            ContentType::Text
        }
        let state = state.clone();
        dispatcher.register(descriptor(
            "document.create",
            &[SCOPE_WRITE],
            handler_fn(move |ctx: RequestContext, params| {
                let state = state.clone();
                async move {
                    let params: CreateDocumentParams = parse(params)?;
                    let document = state
                        .documents
                        .create(
                            &ctx.principal.tenant_id,
                            params.workspace_id,
                            &params.title,
                            params.content_type,
                            &ctx.principal.agent_id,
                        )
                        .await?;
                    ctx.session.subscribe(document_topic(document.id));
                    to_value(&document)
                }
            }),
        ));
    }

    {
        #[derive(Deserialize)]
        struct UpdateDocumentParams {
            document_id: Uuid,
            content: String,
            observed_version: u64,
        }
        let state = state.clone();
        dispatcher.register(descriptor(
            "document.update",
            &[SCOPE_WRITE],
            handler_fn(move |ctx: RequestContext, params| {
                let state = state.clone();
                async move {
                    let params: UpdateDocumentParams = parse(params)?;
                    let document = state
                        .documents
                        .update_content(
                            &ctx.principal.tenant_id,
                            params.document_id,
                            &ctx.principal.agent_id,
                            params.content,
                            params.observed_version,
                        )
                        .await?;
                    to_value(&document)
                }
            }),
        ));
    }

    {
        #[derive(Deserialize)]
        struct LockParams {
            document_id: Uuid,
            duration_secs: Option<i64>,
        }
        let state_lock = state.clone();
        dispatcher.register(descriptor(
            "document.lock",
            &[SCOPE_WRITE],
            handler_fn(move |ctx: RequestContext, params| {
                let state = state_lock.clone();
                async move {
                    let params: LockParams = parse(params)?;
                    let document = state
                        .documents
                        .lock(
                            &ctx.principal.tenant_id,
                            params.document_id,
                            &ctx.principal.agent_id,
                            params.duration_secs,
                        )
                        .await?;
                    to_value(&document)
                }
            }),
        ));

        let state_unlock = state.clone();
        dispatcher.register(descriptor(
            "document.unlock",
            &[SCOPE_WRITE],
            handler_fn(move |ctx: RequestContext, params| {
                let state = state_unlock.clone();
                async move {
                    let params: LockParams = parse(params)?;
                    let document = state
                        .documents
                        .unlock(
                            &ctx.principal.tenant_id,
                            params.document_id,
                            &ctx.principal.agent_id,
                        )
                        .await?;
                    to_value(&document)
                }
            }),
        ));
    }

    {
        #[derive(Deserialize)]
        struct ApplyOperationParams {
            document_id: Uuid,
            kind: DocOpKind,
            #[serde(default)]
            payload: Fields,
            op_id: Option<Uuid>,
            parent_op: Option<Uuid>,
        }
        let state = state.clone();
        dispatcher.register(descriptor(
            "document.apply_operation",
            &[SCOPE_WRITE],
            handler_fn(move |ctx: RequestContext, params| {
                let state = state.clone();
                async move {
                    let params: ApplyOperationParams = parse(params)?;
                    let operation = state
                        .documents
                        .apply_operation(
                            &ctx.principal.tenant_id,
                            params.document_id,
                            &ctx.principal.agent_id,
                            params.kind,
                            params.payload,
                            params.op_id,
                            params.parent_op,
                        )
                        .await?;
                    to_value(&operation)
                }
            }),
        ));
    }

    {
        #[derive(Deserialize)]
        struct StreamOperationsParams {
            document_id: Uuid,
            #[serde(default)]
            after_sequence: u64,
        }
        let state = state.clone();
        dispatcher.register(descriptor(
            "document.stream_operations",
            &[SCOPE_READ],
            handler_fn(move |ctx: RequestContext, params| {
                let state = state.clone();
                async move {
                    let params: StreamOperationsParams = parse(params)?;
                    let operations = state
                        .documents
                        .operations_since(
                            &ctx.principal.tenant_id,
                            params.document_id,
                            params.after_sequence,
                        )
                        .await?;
                    // Live operations follow as topic notifications.
                    ctx.session.subscribe(document_topic(params.document_id));
                    Ok(json!({ "operations": operations }))
                }
            }),
        ));
    }

    // -------------------------------------------------------------- tools

    {
        let state = state.clone();
        dispatcher.register(descriptor(
            "tool.list",
            &[SCOPE_READ],
            handler_fn(move |ctx: RequestContext, _params| {
                let state = state.clone();
                async move {
                    let tools = state.tools.list(&ctx.principal.tenant_id);
                    Ok(json!({ "tools": tools }))
                }
            }),
        ));
    }

    {
        #[derive(Deserialize)]
        struct ExecuteToolParams {
            name: String,
            #[serde(default)]
            arguments: Fields,
        }
        let state = state.clone();
        dispatcher.register(descriptor(
            "tool.execute",
            &[SCOPE_WRITE],
            handler_fn(move |ctx: RequestContext, params| {
                let state = state.clone();
                async move {
                    let params: ExecuteToolParams = parse(params)?;
                    let task = state
                        .tools
                        .execute(
                            &ctx.principal.tenant_id,
                            &params.name,
                            &ctx.principal.agent_id,
                            params.arguments,
                        )
                        .await?;
                    Ok(json!({ "task_id": task.id, "status": task.status }))
                }
            }),
        ));
    }

    {
        #[derive(Deserialize)]
        struct RegisterToolParams {
            name: String,
            #[serde(default)]
            description: String,
            #[serde(default)]
            capabilities: Vec<String>,
        }
        let state = state.clone();
        dispatcher.register(descriptor(
            "tool.register_dynamic",
            &[SCOPE_WRITE],
            handler_fn(move |ctx: RequestContext, params| {
                let state = state.clone();
                async move {
                    let params: RegisterToolParams = parse(params)?;
                    let spec = state.tools.register(
                        &ctx.principal.tenant_id,
                        &params.name,
                        &params.description,
                        &ctx.principal.agent_id,
                        params.capabilities,
                    )?;
                    to_value(&spec)
                }
            }),
        ));
    }

    {
        #[derive(Deserialize)]
        struct ToolHealthParams {
            name: String,
        }
        let state = state.clone();
        dispatcher.register(descriptor(
            "tool.check_health",
            &[SCOPE_READ],
            handler_fn(move |ctx: RequestContext, params| {
                let state = state.clone();
                async move {
                    let params: ToolHealthParams = parse(params)?;
                    let health = state
                        .tools
                        .check_health(&ctx.principal.tenant_id, &params.name)?;
                    to_value(&health)
                }
            }),
        ));
    }

    dispatcher
}
