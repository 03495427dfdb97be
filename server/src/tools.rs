//! Dynamic tool registry.
//!
//! Tools are capabilities provided by connected agents. A provider
//! registers a tool at runtime; `tool.execute` turns an invocation into a
//! task dispatched to the provider, so tool calls flow through the same
//! lifecycle, audit, and retry machinery as every other unit of work.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use mesh_core::error::{MeshError, Result};
use mesh_core::models::{Fields, NewTask, Task, TaskPriority};
use mesh_engine::tasks::TaskEngine;
use mesh_protocol::pool::ConnectionPool;

/// One registered tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// Agent that serves invocations
    pub provider_agent: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub registered_at: DateTime<Utc>,
}

/// Health of a tool as observed right now.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolHealth {
    pub name: String,
    pub healthy: bool,
    /// Live sessions the provider currently holds
    pub provider_sessions: usize,
}

/// Tenant-scoped registry of dynamic tools.
pub struct ToolRegistry {
    tools: Mutex<HashMap<(String, String), ToolSpec>>,
    tasks: Arc<TaskEngine>,
    pool: Arc<ConnectionPool>,
}

impl ToolRegistry {
    pub fn new(tasks: Arc<TaskEngine>, pool: Arc<ConnectionPool>) -> Self {
        Self {
            tools: Mutex::new(HashMap::new()),
            tasks,
            pool,
        }
    }

    /// Register a tool served by `provider_agent`. Re-registration by the
    /// same provider updates the spec; another provider's name is taken.
    pub fn register(
        &self,
        tenant_id: &str,
        name: &str,
        description: &str,
        provider_agent: &str,
        capabilities: Vec<String>,
    ) -> Result<ToolSpec> {
        if name.trim().is_empty() {
            return Err(MeshError::Validation("tool name cannot be empty".into()));
        }
        let key = (tenant_id.to_string(), name.to_string());
        let mut tools = self.tools.lock();
        if let Some(existing) = tools.get(&key) {
            if existing.provider_agent != provider_agent {
                return Err(MeshError::Conflict(format!(
                    "tool '{name}' is registered by '{}'",
                    existing.provider_agent
                )));
            }
        }
        let spec = ToolSpec {
            name: name.to_string(),
            description: description.to_string(),
            provider_agent: provider_agent.to_string(),
            capabilities,
            registered_at: Utc::now(),
        };
        tools.insert(key, spec.clone());
        Ok(spec)
    }

    pub fn list(&self, tenant_id: &str) -> Vec<ToolSpec> {
        let mut out: Vec<ToolSpec> = self
            .tools
            .lock()
            .iter()
            .filter(|((tenant, _), _)| tenant == tenant_id)
            .map(|(_, spec)| spec.clone())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn get(&self, tenant_id: &str, name: &str) -> Result<ToolSpec> {
        self.tools
            .lock()
            .get(&(tenant_id.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| MeshError::not_found("tool", name))
    }

    /// Invoke a tool by creating a high-priority task for its provider.
    pub async fn execute(
        &self,
        tenant_id: &str,
        name: &str,
        caller: &str,
        arguments: Fields,
    ) -> Result<Task> {
        let spec = self.get(tenant_id, name)?;
        if self
            .pool
            .sessions_for_agent(tenant_id, &spec.provider_agent)
            .is_empty()
        {
            return Err(MeshError::ServiceUnavailable {
                retry_after_secs: 5,
            });
        }

        let mut new_task = NewTask::new(tenant_id, format!("tool:{name}"), caller);
        new_task.priority = TaskPriority::High;
        new_task.assigned_to = Some(spec.provider_agent.clone());
        new_task.parameters = arguments;
        new_task
            .parameters
            .insert("tool".to_string(), json!(name));
        self.tasks.create(new_task).await
    }

    /// A tool is healthy while its provider holds at least one live
    /// session.
    pub fn check_health(&self, tenant_id: &str, name: &str) -> Result<ToolHealth> {
        let spec = self.get(tenant_id, name)?;
        let sessions = self
            .pool
            .sessions_for_agent(tenant_id, &spec.provider_agent)
            .len();
        Ok(ToolHealth {
            name: spec.name,
            healthy: sessions > 0,
            provider_sessions: sessions,
        })
    }
}
