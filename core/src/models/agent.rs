use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Availability of a registered agent.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Agent is online and can take work
    Available,
    /// Agent is at capacity but still connected
    Busy,
    /// Agent has no live session
    Offline,
}

/// A registered external actor. Sessions reference agents by id; the
/// profile itself is owned by the tenant's registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentProfile {
    /// Stable agent identifier, kebab-case
    pub agent_id: String,
    pub tenant_id: String,
    /// Declared capability strings used for task matching
    pub capabilities: Vec<String>,
    pub status: AgentStatus,
    /// Number of tasks currently assigned or accepted
    pub active_tasks: u32,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl AgentProfile {
    pub fn new(agent_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            agent_id: agent_id.into(),
            tenant_id: tenant_id.into(),
            capabilities: Vec::new(),
            status: AgentStatus::Available,
            active_tasks: 0,
            registered_at: now,
            last_heartbeat: now,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Whether the agent declares every capability in `required`.
    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required.iter().all(|c| self.capabilities.contains(c))
    }

    pub fn is_available(&self) -> bool {
        self.status == AgentStatus::Available
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Available => write!(f, "available"),
            AgentStatus::Busy => write!(f, "busy"),
            AgentStatus::Offline => write!(f, "offline"),
        }
    }
}
