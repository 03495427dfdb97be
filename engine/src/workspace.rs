//! Workspace runtime: membership and versioned shared state.
//!
//! Every state update names the version it observed. A stale observer is
//! either rejected with `Conflict` or, when it opts in, merged through the
//! merge engine against the current state. Membership is tracked as a
//! last-write-wins set stamped by the shared clock, so concurrent joins
//! and leaves converge.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info};
use uuid::Uuid;

use mesh_core::clock::HybridLogicalClock;
use mesh_core::crdt::LwwSet;
use mesh_core::error::{MeshError, Result};
use mesh_core::merge::{MergeContext, MergeEngine};
use mesh_core::models::{
    Fields, MemberRole, Visibility, Workspace, WorkspaceMember, MAX_WORKSPACE_MEMBERS,
};
use mesh_core::mvcc::{IsolationLevel, MvccStore};
use mesh_core::oplog::OperationLog;
use mesh_core::repository::WorkspaceRepository;
use mesh_core::validation;

use crate::notify::NotificationSink;
use crate::recorder::AuditRecorder;

fn workspace_topic(id: Uuid) -> String {
    format!("workspace:{id}")
}

/// Result of a state update attempt.
#[derive(Debug, Clone)]
pub struct StateUpdate {
    pub workspace: Workspace,
    /// Set when the update went through the merge engine
    pub merged: bool,
    pub conflicts: Vec<String>,
}

/// The workspace service.
pub struct WorkspaceService {
    workspaces: Arc<dyn WorkspaceRepository>,
    merge: MergeEngine,
    mvcc: MvccStore,
    oplog: OperationLog,
    recorder: AuditRecorder,
    sink: Arc<dyn NotificationSink>,
    clock: Arc<HybridLogicalClock>,
}

impl WorkspaceService {
    pub fn new(
        workspaces: Arc<dyn WorkspaceRepository>,
        mvcc: MvccStore,
        oplog: OperationLog,
        recorder: AuditRecorder,
        sink: Arc<dyn NotificationSink>,
        clock: Arc<HybridLogicalClock>,
    ) -> Self {
        Self {
            workspaces,
            merge: MergeEngine::new(),
            mvcc,
            oplog,
            recorder,
            sink,
            clock,
        }
    }

    /// Stage the new state through a serializable transaction. Two racing
    /// in-process writers against the same workspace collide here before
    /// either touches the repository.
    fn stage_state(&self, id: Uuid, state: &Fields) -> Result<()> {
        let key = format!("workspace:{id}:state");
        let mut tx = self.mvcc.begin(IsolationLevel::Serializable);
        self.mvcc.read(&mut tx, &key)?;
        self.mvcc
            .write(&mut tx, &key, Value::Object(state.clone()))?;
        self.mvcc.commit(&mut tx)?;
        Ok(())
    }

    async fn load(&self, tenant_id: &str, id: Uuid) -> Result<Workspace> {
        self.workspaces
            .get(tenant_id, id)
            .await?
            .ok_or_else(|| MeshError::not_found("workspace", id))
    }

    /// Create a workspace; the owner becomes its first member.
    pub async fn create(
        &self,
        tenant_id: &str,
        name: &str,
        owner: &str,
        visibility: Visibility,
        max_members: Option<u32>,
    ) -> Result<Workspace> {
        validation::validate_tenant_id(tenant_id)?;
        validation::validate_agent_id(owner)?;
        if name.trim().is_empty() {
            return Err(MeshError::Validation("workspace name cannot be empty".into()));
        }
        let max_members = max_members.unwrap_or(MAX_WORKSPACE_MEMBERS);
        if max_members == 0 || max_members > MAX_WORKSPACE_MEMBERS {
            return Err(MeshError::Validation(format!(
                "max_members must be in 1..={MAX_WORKSPACE_MEMBERS}"
            )));
        }

        let mut workspace = Workspace::new(tenant_id, name, owner);
        workspace.visibility = visibility;
        workspace.max_members = max_members;

        // Membership is carried in the state map as a LWW set keyed by
        // agent id, alongside the relational member rows.
        let mut members = LwwSet::new();
        members.add(owner, self.clock.now());
        workspace.state.insert(
            "_members".to_string(),
            serde_json::to_value(&members)
                .map_err(|e| MeshError::Internal(format!("member set encode failed: {e}")))?,
        );

        let stored = self.workspaces.create(workspace).await?;
        self.workspaces
            .add_member(WorkspaceMember::new(stored.id, owner, MemberRole::Owner))
            .await?;

        self.recorder
            .insert(tenant_id, "workspace", stored.id, &stored, owner)
            .await;
        info!(workspace_id = %stored.id, name, "workspace created");
        Ok(stored)
    }

    pub async fn get(&self, tenant_id: &str, id: Uuid) -> Result<Workspace> {
        self.load(tenant_id, id).await
    }

    pub async fn members(&self, tenant_id: &str, id: Uuid) -> Result<Vec<WorkspaceMember>> {
        self.load(tenant_id, id).await?;
        self.workspaces.members(id).await
    }

    /// Join an agent into the workspace.
    pub async fn join(
        &self,
        tenant_id: &str,
        id: Uuid,
        agent_id: &str,
        role: MemberRole,
    ) -> Result<WorkspaceMember> {
        validation::validate_agent_id(agent_id)?;
        let workspace = self.load(tenant_id, id).await?;

        if workspace.visibility == Visibility::Private && role != MemberRole::Owner {
            return Err(MeshError::Forbidden(
                "private workspaces are invitation-only".into(),
            ));
        }
        let members = self.workspaces.members(id).await?;
        if members.len() as u32 >= workspace.max_members {
            return Err(MeshError::Conflict(format!(
                "workspace is full ({} members)",
                workspace.max_members
            )));
        }

        let member = self
            .workspaces
            .add_member(WorkspaceMember::new(id, agent_id, role))
            .await?;
        self.touch_member_set(tenant_id, id, agent_id, true).await?;

        self.sink.broadcast(
            &workspace_topic(id),
            "workspace.member_joined",
            json!({ "workspace_id": id, "agent_id": agent_id }),
        );
        Ok(member)
    }

    pub async fn leave(&self, tenant_id: &str, id: Uuid, agent_id: &str) -> Result<()> {
        let workspace = self.load(tenant_id, id).await?;
        if workspace.owner == agent_id {
            return Err(MeshError::Conflict("the owner cannot leave".into()));
        }
        self.workspaces.remove_member(id, agent_id).await?;
        self.touch_member_set(tenant_id, id, agent_id, false).await?;

        self.sink.broadcast(
            &workspace_topic(id),
            "workspace.member_left",
            json!({ "workspace_id": id, "agent_id": agent_id }),
        );
        Ok(())
    }

    /// Stamp the LWW member set with a join or leave, retrying the version
    /// race a few times.
    async fn touch_member_set(
        &self,
        tenant_id: &str,
        id: Uuid,
        agent_id: &str,
        joined: bool,
    ) -> Result<()> {
        for _ in 0..5 {
            let workspace = self.load(tenant_id, id).await?;
            let mut members: LwwSet = workspace
                .state
                .get("_members")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default();
            let ts = self.clock.now();
            if joined {
                members.add(agent_id, ts);
            } else {
                members.remove(agent_id, ts);
            }

            let expected = workspace.state_version;
            let mut updated = workspace;
            updated.state.insert(
                "_members".to_string(),
                serde_json::to_value(&members)
                    .map_err(|e| MeshError::Internal(format!("member set encode failed: {e}")))?,
            );
            match self.workspaces.update_with_version(updated, expected).await {
                Ok(_) => return Ok(()),
                Err(MeshError::OptimisticLock { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(MeshError::Conflict(
            "workspace is changing too quickly, retry".into(),
        ))
    }

    /// Apply a state update observed at `observed_version`.
    ///
    /// A stale observer is rejected with `Conflict` unless `merge` is set,
    /// in which case the update is three-way merged against the current
    /// state with the caller's fields as "ours".
    pub async fn update_state(
        &self,
        tenant_id: &str,
        id: Uuid,
        agent_id: &str,
        updates: Fields,
        observed_version: u64,
        merge: bool,
    ) -> Result<StateUpdate> {
        let member = self
            .workspaces
            .get_member(id, agent_id)
            .await?
            .ok_or_else(|| MeshError::Forbidden("not a workspace member".into()))?;
        if !member.role.can_write() {
            return Err(MeshError::Forbidden(format!(
                "role {:?} cannot write workspace state",
                member.role
            )));
        }

        let workspace = self.load(tenant_id, id).await?;

        if workspace.state_version != observed_version {
            if !merge {
                return Err(MeshError::stale_version(
                    observed_version,
                    workspace.state_version,
                ));
            }
            return self
                .merge_state(tenant_id, workspace, agent_id, updates)
                .await;
        }

        let old_state = workspace.state.clone();
        let expected = workspace.state_version;
        let mut updated = workspace;
        for (key, value) in &updates {
            updated.state.insert(key.clone(), value.clone());
        }
        self.stage_state(id, &updated.state)?;
        let stored = self.workspaces.update_with_version(updated, expected).await?;

        self.journal_state(&stored, agent_id, &updates).await;
        self.recorder
            .update(
                tenant_id,
                "workspace",
                stored.id,
                &Value::Object(old_state),
                &Value::Object(stored.state.clone()),
                agent_id,
            )
            .await;
        self.sink.broadcast(
            &workspace_topic(id),
            "workspace.state_updated",
            json!({ "workspace_id": id, "state_version": stored.state_version }),
        );
        Ok(StateUpdate {
            workspace: stored,
            merged: false,
            conflicts: Vec::new(),
        })
    }

    /// Merge a stale update against the current state. The caller's fields
    /// win when only they changed; double-sided changes become conflict
    /// markers for the caller to resolve.
    async fn merge_state(
        &self,
        tenant_id: &str,
        workspace: Workspace,
        agent_id: &str,
        updates: Fields,
    ) -> Result<StateUpdate> {
        let base = Value::Object(Fields::new());
        let theirs = Value::Object(workspace.state.clone());
        let ours = Value::Object(updates.clone());
        let ctx = MergeContext::new(self.clock.now(), self.clock.now());
        let outcome = self.merge.merge(&base, &ours, &theirs, &ctx)?;

        let merged_state = match outcome.value {
            Value::Object(map) => map,
            other => {
                return Err(MeshError::Internal(format!(
                    "merge produced a non-object state: {other}"
                )))
            }
        };

        let expected = workspace.state_version;
        let id = workspace.id;
        let mut updated = workspace;
        updated.state = merged_state;
        self.stage_state(id, &updated.state)?;
        let stored = self.workspaces.update_with_version(updated, expected).await?;

        debug!(workspace_id = %stored.id, conflicts = outcome.conflicts.len(), "state merged");
        self.journal_state(&stored, agent_id, &updates).await;
        self.sink.broadcast(
            &workspace_topic(stored.id),
            "workspace.state_updated",
            json!({ "workspace_id": stored.id, "state_version": stored.state_version, "merged": true }),
        );
        Ok(StateUpdate {
            workspace: stored,
            merged: true,
            conflicts: outcome.conflicts,
        })
    }

    async fn journal_state(&self, workspace: &Workspace, agent_id: &str, updates: &Fields) {
        let payload = json!({ "updates": updates, "state_version": workspace.state_version });
        if let Err(err) = self.oplog.append(
            workspace_topic(workspace.id),
            agent_id,
            "state_update",
            &payload,
        ) {
            tracing::warn!(%err, workspace_id = %workspace.id, "oplog append failed");
        }
    }
}
