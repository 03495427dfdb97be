use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Fields;

/// Who may discover and join a workspace.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Private,
    Team,
    Public,
}

/// Member role inside a workspace, strongest first.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Viewer,
    Member,
    Admin,
    Owner,
}

impl MemberRole {
    pub fn can_write(&self) -> bool {
        matches!(self, MemberRole::Member | MemberRole::Admin | MemberRole::Owner)
    }

    pub fn can_manage_members(&self) -> bool {
        matches!(self, MemberRole::Admin | MemberRole::Owner)
    }
}

/// Hard cap on members per workspace.
pub const MAX_WORKSPACE_MEMBERS: u32 = 1000;

/// Shared state container hosting members and documents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workspace {
    pub id: Uuid,
    pub tenant_id: String,
    pub name: String,
    pub visibility: Visibility,
    pub owner: String,
    /// At most [`MAX_WORKSPACE_MEMBERS`]
    pub max_members: u32,
    pub state: Fields,
    /// Strictly increases with every state update
    pub state_version: u64,
    pub config: Fields,
    pub last_activity: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Workspace {
    pub fn new(
        tenant_id: impl Into<String>,
        name: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            name: name.into(),
            visibility: Visibility::Team,
            owner: owner.into(),
            max_members: MAX_WORKSPACE_MEMBERS,
            state: Fields::new(),
            state_version: 1,
            config: Fields::new(),
            last_activity: now,
            created_at: now,
        }
    }
}

/// Relation between a workspace and an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceMember {
    pub workspace_id: Uuid,
    pub agent_id: String,
    pub role: MemberRole,
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Member-scoped scratch state
    #[serde(default)]
    pub state: Fields,
    pub joined_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl WorkspaceMember {
    pub fn new(workspace_id: Uuid, agent_id: impl Into<String>, role: MemberRole) -> Self {
        let now = Utc::now();
        Self {
            workspace_id,
            agent_id: agent_id.into(),
            role,
            permissions: Vec::new(),
            state: Fields::new(),
            joined_at: now,
            last_seen_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_permissions() {
        assert!(MemberRole::Owner.can_write());
        assert!(MemberRole::Owner.can_manage_members());
        assert!(MemberRole::Member.can_write());
        assert!(!MemberRole::Member.can_manage_members());
        assert!(!MemberRole::Viewer.can_write());
    }

    #[test]
    fn test_role_ordering() {
        assert!(MemberRole::Owner > MemberRole::Admin);
        assert!(MemberRole::Admin > MemberRole::Member);
        assert!(MemberRole::Member > MemberRole::Viewer);
    }
}
