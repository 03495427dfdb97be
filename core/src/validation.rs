//! Field-level validation shared by the engine and the protocol layer.

use std::collections::BTreeMap;

use crate::dag;
use crate::error::{MeshError, Result};
use crate::models::{NewTask, SubtaskSpec, Workflow};

/// Longest accepted task type string.
pub const MAX_TASK_TYPE_LEN: usize = 100;

/// Hard ceiling on per-task retry budgets.
pub const MAX_RETRIES_CAP: u32 = 10;

/// Agent ids are kebab-case: lowercase letters, digits, and hyphens.
pub fn validate_agent_id(agent_id: &str) -> Result<()> {
    if agent_id.trim().is_empty() {
        return Err(MeshError::Validation("agent id cannot be empty".into()));
    }
    if !agent_id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(MeshError::Validation(format!(
            "agent id '{agent_id}' must be kebab-case (lowercase letters, digits, hyphens)"
        )));
    }
    Ok(())
}

pub fn validate_tenant_id(tenant_id: &str) -> Result<()> {
    if tenant_id.trim().is_empty() {
        return Err(MeshError::Validation("tenant id cannot be empty".into()));
    }
    Ok(())
}

/// Checks applied to every task before it is persisted.
pub fn validate_new_task(task: &NewTask) -> Result<()> {
    validate_tenant_id(&task.tenant_id)?;
    validate_agent_id(&task.created_by)?;
    if let Some(assignee) = &task.assigned_to {
        validate_agent_id(assignee)?;
    }
    if task.task_type.trim().is_empty() {
        return Err(MeshError::Validation("task type cannot be empty".into()));
    }
    if task.task_type.len() > MAX_TASK_TYPE_LEN {
        return Err(MeshError::Validation(format!(
            "task type exceeds {MAX_TASK_TYPE_LEN} characters"
        )));
    }
    if task.max_retries > MAX_RETRIES_CAP {
        return Err(MeshError::Validation(format!(
            "max_retries {} exceeds the cap of {MAX_RETRIES_CAP}",
            task.max_retries
        )));
    }
    if task.timeout_secs == 0 {
        return Err(MeshError::Validation("timeout must be positive".into()));
    }
    Ok(())
}

/// Validate a distributed task's subtask declarations: unique ids, known
/// dependencies, and an acyclic dependency graph.
pub fn validate_subtasks(subtasks: &[SubtaskSpec]) -> Result<()> {
    if subtasks.is_empty() {
        return Err(MeshError::Validation(
            "a distributed task needs at least one subtask".into(),
        ));
    }

    let mut edges: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for subtask in subtasks {
        if subtask.subtask_id.trim().is_empty() {
            return Err(MeshError::Validation("subtask id cannot be empty".into()));
        }
        if edges
            .insert(subtask.subtask_id.clone(), subtask.depends_on.clone())
            .is_some()
        {
            return Err(MeshError::Validation(format!(
                "duplicate subtask id '{}'",
                subtask.subtask_id
            )));
        }
    }
    dag::ensure_acyclic(&edges)
}

/// Validate a workflow template: unique step ids and an acyclic step graph.
pub fn validate_workflow(workflow: &Workflow) -> Result<()> {
    validate_tenant_id(&workflow.tenant_id)?;
    if workflow.name.trim().is_empty() {
        return Err(MeshError::Validation("workflow name cannot be empty".into()));
    }
    if workflow.steps.is_empty() {
        return Err(MeshError::Validation(
            "a workflow needs at least one step".into(),
        ));
    }

    let mut seen = std::collections::HashSet::new();
    for step in &workflow.steps {
        if !seen.insert(&step.step_id) {
            return Err(MeshError::Validation(format!(
                "duplicate step id '{}'",
                step.step_id
            )));
        }
        if !workflow.roles.contains_key(&step.role) {
            return Err(MeshError::Validation(format!(
                "step '{}' references undeclared role '{}'",
                step.step_id, step.role
            )));
        }
    }
    dag::ensure_acyclic(&workflow.dependency_edges())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RoleSelector, WorkflowKind, WorkflowStep};
    use chrono::Utc;
    use std::collections::HashMap;
    use uuid::Uuid;

    #[test]
    fn test_agent_id_format() {
        assert!(validate_agent_id("backend-dev-1").is_ok());
        assert!(validate_agent_id("").is_err());
        assert!(validate_agent_id("Backend").is_err());
        assert!(validate_agent_id("agent_one").is_err());
        assert!(validate_agent_id("agent one").is_err());
    }

    #[test]
    fn test_new_task_bounds() {
        let mut task = NewTask::new("t1", "review", "agent-a");
        assert!(validate_new_task(&task).is_ok());

        task.task_type = "x".repeat(101);
        assert!(validate_new_task(&task).is_err());

        task.task_type = "review".into();
        task.max_retries = 11;
        assert!(validate_new_task(&task).is_err());

        task.max_retries = 3;
        task.timeout_secs = 0;
        assert!(validate_new_task(&task).is_err());
    }

    #[test]
    fn test_subtask_duplicate_ids() {
        let subtask = |id: &str, deps: &[&str]| SubtaskSpec {
            subtask_id: id.into(),
            task_type: "work".into(),
            parameters: Default::default(),
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            assigned_to: None,
            required_capabilities: vec![],
        };

        assert!(validate_subtasks(&[subtask("s1", &[]), subtask("s1", &[])]).is_err());
        assert!(validate_subtasks(&[subtask("s1", &[]), subtask("s2", &["s1"])]).is_ok());
        // Cycle
        assert!(
            validate_subtasks(&[subtask("s1", &["s2"]), subtask("s2", &["s1"])]).is_err()
        );
        assert!(validate_subtasks(&[]).is_err());
    }

    #[test]
    fn test_workflow_role_references() {
        let step = WorkflowStep {
            step_id: "s1".into(),
            role: "ghost".into(),
            action: "act".into(),
            input: Default::default(),
            depends_on: vec![],
            guards: vec![],
            timeout_secs: None,
            retry_count: 0,
            on_failure: Default::default(),
            output_mapping: HashMap::new(),
        };
        let workflow = Workflow {
            id: Uuid::new_v4(),
            tenant_id: "t1".into(),
            name: "wf".into(),
            kind: WorkflowKind::Sequential,
            version: 1,
            roles: HashMap::from([("analyst".to_string(), RoleSelector::Any)]),
            steps: vec![step],
            max_parallel: None,
            global_timeout_secs: None,
            active: true,
            created_at: Utc::now(),
        };
        assert!(validate_workflow(&workflow).is_err());
    }
}
