//! End-to-end scenarios over the in-process runtime.

use integration_tests::TestHarness;
use serde_json::json;

// ---------------------------------------------------------------------
// Delegation chain

#[tokio::test]
async fn delegation_chain_with_history_and_notifications() {
    let harness = TestHarness::new();
    let mut a = harness.connect("agent-a", "t1", &["review"]).await;
    let mut b = harness.connect("agent-b", "t1", &["review"]).await;
    let mut c = harness.connect("agent-c", "t1", &["review"]).await;
    let mut d = harness.connect("agent-d", "t1", &["review"]).await;

    let task = a
        .expect_ok(
            "task.create",
            json!({
                "task_type": "code_review",
                "priority": "high",
                "assigned_to": "agent-a",
            }),
        )
        .await;
    let task_id = task["id"].as_str().unwrap().to_string();

    a.expect_ok(
        "task.delegate",
        json!({ "task_id": task_id, "to_agent": "agent-b", "reason": "workload" }),
    )
    .await;
    let after_second = b
        .expect_ok(
            "task.delegate",
            json!({ "task_id": task_id, "to_agent": "agent-c", "reason": "expertise" }),
        )
        .await;
    assert_eq!(after_second["assigned_to"], "agent-c");

    // History records both hops in order.
    let detail = a
        .expect_ok("task.get", json!({ "task_id": task_id }))
        .await;
    let delegations = detail["delegations"].as_array().unwrap();
    assert_eq!(delegations.len(), 2);
    assert_eq!(delegations[0]["from_agent"], "agent-a");
    assert_eq!(delegations[0]["to_agent"], "agent-b");
    assert_eq!(delegations[1]["from_agent"], "agent-b");
    assert_eq!(delegations[1]["to_agent"], "agent-c");

    // B and C were notified of their hops.
    assert!(b
        .drain_notifications()
        .iter()
        .any(|n| n.method.as_deref() == Some("task.delegated")));
    assert!(c
        .drain_notifications()
        .iter()
        .any(|n| n.method.as_deref() == Some("task.delegated")));

    // Third hop fills the budget of three; the fourth is rejected.
    c.expect_ok(
        "task.delegate",
        json!({ "task_id": task_id, "to_agent": "agent-d", "reason": "handoff" }),
    )
    .await;
    let denied = d
        .call(
            "task.delegate",
            json!({ "task_id": task_id, "to_agent": "agent-a", "reason": "one too many" }),
        )
        .await;
    assert_eq!(denied.error.unwrap().code, 409);
}

// ---------------------------------------------------------------------
// Distributed task aggregation

#[tokio::test]
async fn distributed_aggregation_with_partial_failure() {
    let harness = TestHarness::new();
    let mut creator = harness.connect("agent-a", "t1", &[]).await;
    let mut worker = harness.connect("agent-w", "t1", &[]).await;

    let created = creator
        .expect_ok(
            "task.create_distributed",
            json!({
                "task_type": "analysis",
                "subtasks": [
                    { "subtask_id": "s1", "task_type": "part", "assigned_to": "agent-w" },
                    { "subtask_id": "s2", "task_type": "part", "assigned_to": "agent-w" },
                    { "subtask_id": "s3", "task_type": "part", "assigned_to": "agent-w" },
                ],
                "aggregation": "combine",
                "wait_policy": "wait_for_all",
                "failure_policy": "continue_on_failure",
            }),
        )
        .await;
    let parent_id = created["parent"]["id"].as_str().unwrap().to_string();
    let s3_id = created["subtasks"]
        .as_array()
        .unwrap()
        .iter()
        .find(|t| t["parameters"]["subtask_id"] == "s3")
        .unwrap()["id"]
        .as_str()
        .unwrap()
        .to_string();

    creator
        .expect_ok(
            "task.submit_result",
            json!({ "parent_task_id": parent_id, "subtask_id": "s1", "result": { "x": 1 } }),
        )
        .await;
    creator
        .expect_ok(
            "task.submit_result",
            json!({ "parent_task_id": parent_id, "subtask_id": "s2", "result": { "y": 2 } }),
        )
        .await;
    // s3 fails through the normal completion path.
    worker
        .expect_ok(
            "task.complete",
            json!({ "task_id": s3_id, "error": "exploded" }),
        )
        .await;

    let parent = creator
        .expect_ok("task.get", json!({ "task_id": parent_id }))
        .await;
    assert_eq!(parent["task"]["status"], "completed");
    let result = &parent["task"]["result"];
    assert_eq!(result["x"], 1);
    assert_eq!(result["y"], 2);
    assert_eq!(result["_partial_failure"], json!(["s3"]));
}

#[tokio::test]
async fn distributed_fail_fast_cancels_siblings() {
    let harness = TestHarness::new();
    let mut creator = harness.connect("agent-a", "t1", &[]).await;
    let mut worker = harness.connect("agent-w", "t1", &[]).await;

    let created = creator
        .expect_ok(
            "task.create_distributed",
            json!({
                "task_type": "analysis",
                "subtasks": [
                    { "subtask_id": "s1", "task_type": "part", "assigned_to": "agent-w" },
                    { "subtask_id": "s2", "task_type": "part", "assigned_to": "agent-w" },
                    { "subtask_id": "s3", "task_type": "part", "assigned_to": "agent-w" },
                ],
                "aggregation": "combine",
                "wait_policy": "wait_for_all",
                "failure_policy": "fail_fast",
            }),
        )
        .await;
    let parent_id = created["parent"]["id"].as_str().unwrap().to_string();
    let s3_id = created["subtasks"]
        .as_array()
        .unwrap()
        .iter()
        .find(|t| t["parameters"]["subtask_id"] == "s3")
        .unwrap()["id"]
        .as_str()
        .unwrap()
        .to_string();

    worker
        .expect_ok(
            "task.complete",
            json!({ "task_id": s3_id, "error": "exploded" }),
        )
        .await;

    let parent = creator
        .expect_ok("task.get", json!({ "task_id": parent_id }))
        .await;
    assert_eq!(parent["task"]["status"], "failed");

    // Surviving siblings were cancelled and their assignee told.
    let listing = creator
        .expect_ok("task.list", json!({ "parent_id": parent_id }))
        .await;
    for task in listing["tasks"].as_array().unwrap() {
        if task["parameters"]["subtask_id"] != "s3" {
            assert_eq!(task["status"], "cancelled");
        }
    }
    assert!(worker
        .drain_notifications()
        .iter()
        .any(|n| n.method.as_deref() == Some("task.cancelled")));
}

// ---------------------------------------------------------------------
// Concurrent document edits

#[tokio::test]
async fn concurrent_document_inserts_converge_deterministically() {
    let harness = TestHarness::new();
    let mut a = harness.connect("agent-a", "t1", &[]).await;
    let mut b = harness.connect("agent-b", "t1", &[]).await;

    let workspace = a
        .expect_ok("workspace.create", json!({ "name": "shared" }))
        .await;
    let doc = a
        .expect_ok(
            "document.create",
            json!({ "workspace_id": workspace["id"], "title": "draft" }),
        )
        .await;
    let doc_id = doc["id"].as_str().unwrap().to_string();

    for (i, ch) in ["h", "e", "l", "l", "o"].iter().enumerate() {
        a.expect_ok(
            "document.apply_operation",
            json!({
                "document_id": doc_id,
                "kind": "insert",
                "payload": { "position": i, "value": ch },
            }),
        )
        .await;
    }

    // Two agents insert at position 5; the second one's edit carries the
    // newer timestamp and lands first in the tie-break order.
    let op_a = a
        .expect_ok(
            "document.apply_operation",
            json!({
                "document_id": doc_id,
                "kind": "insert",
                "payload": { "position": 5, "value": "A" },
            }),
        )
        .await;
    b.expect_ok(
        "document.apply_operation",
        json!({
            "document_id": doc_id,
            "kind": "insert",
            "payload": { "position": 5, "value": "B" },
        }),
    )
    .await;

    let stored = harness
        .runtime
        .state
        .documents
        .get("t1", doc_id.parse().unwrap())
        .await
        .unwrap();
    assert_eq!(stored.content.len(), 7);
    assert!(stored.content.contains('A') && stored.content.contains('B'));

    // Re-applying a known operation changes nothing.
    let replay = a
        .expect_ok(
            "document.apply_operation",
            json!({
                "document_id": doc_id,
                "kind": "insert",
                "payload": { "position": 5, "value": "A" },
                "op_id": op_a["op_id"],
            }),
        )
        .await;
    assert_eq!(replay["sequence"], op_a["sequence"]);
    let after = harness
        .runtime
        .state
        .documents
        .get("t1", doc_id.parse().unwrap())
        .await
        .unwrap();
    assert_eq!(after.content, stored.content);

    // The full operation stream is available for catch-up.
    let stream = b
        .expect_ok(
            "document.stream_operations",
            json!({ "document_id": doc_id, "after_sequence": 0 }),
        )
        .await;
    assert_eq!(stream["operations"].as_array().unwrap().len(), 7);
}

// ---------------------------------------------------------------------
// Optimistic workspace update

#[tokio::test]
async fn optimistic_workspace_update_rejects_then_succeeds() {
    let harness = TestHarness::new();
    let mut a = harness.connect("agent-a", "t1", &[]).await;
    let mut b = harness.connect("agent-b", "t1", &[]).await;

    let workspace = a
        .expect_ok("workspace.create", json!({ "name": "shared" }))
        .await;
    let ws_id = workspace["id"].as_str().unwrap().to_string();
    b.expect_ok("workspace.join", json!({ "workspace_id": ws_id }))
        .await;

    let state = a
        .expect_ok("workspace.get_state", json!({ "workspace_id": ws_id }))
        .await;
    let observed = state["state_version"].as_u64().unwrap();

    // B commits first, advancing the version.
    b.expect_ok(
        "workspace.update_state",
        json!({
            "workspace_id": ws_id,
            "updates": { "theme": "dark" },
            "observed_version": observed,
        }),
    )
    .await;

    // A's stale update is rejected with a conflict.
    let denied = a
        .call(
            "workspace.update_state",
            json!({
                "workspace_id": ws_id,
                "updates": { "lang": "rust" },
                "observed_version": observed,
            }),
        )
        .await;
    assert_eq!(denied.error.unwrap().code, 409);

    // A re-reads and re-applies successfully.
    let state = a
        .expect_ok("workspace.get_state", json!({ "workspace_id": ws_id }))
        .await;
    let current = state["state_version"].as_u64().unwrap();
    assert_eq!(current, observed + 1);

    let update = a
        .expect_ok(
            "workspace.update_state",
            json!({
                "workspace_id": ws_id,
                "updates": { "lang": "rust" },
                "observed_version": current,
            }),
        )
        .await;
    assert_eq!(
        update["workspace"]["state_version"].as_u64().unwrap(),
        current + 1
    );
    assert_eq!(update["workspace"]["state"]["theme"], "dark");
    assert_eq!(update["workspace"]["state"]["lang"], "rust");
}

// ---------------------------------------------------------------------
// Sequential workflow

#[tokio::test]
async fn sequential_workflow_passes_step_output_forward() {
    let harness = TestHarness::new();
    let mut zero = harness.connect("agent-zero", "t1", &[]).await;
    let mut a1 = harness.connect("a1", "t1", &["analyze"]).await;
    let mut a2 = harness.connect("a2", "t1", &["build"]).await;

    let workflow = zero
        .expect_ok(
            "workflow.create",
            json!({
                "name": "review-pipeline",
                "kind": "sequential",
                "roles": {
                    "analyst": { "specific": "a1" },
                    "builder": { "specific": "a2" },
                },
                "steps": [
                    { "step_id": "step1", "role": "analyst", "action": "analyze" },
                    {
                        "step_id": "step2",
                        "role": "builder",
                        "action": "build",
                        "depends_on": ["step1"],
                        "input": { "step_input": "$step1.output" },
                    },
                ],
            }),
        )
        .await;

    let execution = zero
        .expect_ok(
            "workflow.execute",
            json!({ "workflow_id": workflow["id"], "inputs": { "repo": "r" } }),
        )
        .await;
    let execution_id = execution["id"].as_str().unwrap().to_string();
    assert_eq!(execution["status"], "running");
    assert_eq!(execution["step_states"]["step1"], "running");

    // a1 sees its step task arrive.
    assert!(a1
        .drain_notifications()
        .iter()
        .any(|n| n.method.as_deref() == Some("task.assigned")));

    let execution = a1
        .expect_ok(
            "workflow.complete_task",
            json!({
                "execution_id": execution_id,
                "step_id": "step1",
                "result": { "issues": 3 },
            }),
        )
        .await;
    assert_eq!(execution["step_states"]["step2"], "running");

    // Step 2's task carries step 1's output as its input.
    let step2_task_id = execution["step_tasks"]["step2"].as_str().unwrap();
    let step2_task = a2
        .expect_ok("task.get", json!({ "task_id": step2_task_id }))
        .await;
    assert_eq!(step2_task["task"]["assigned_to"], "a2");
    assert_eq!(step2_task["task"]["parameters"]["step_input"]["issues"], 3);

    let execution = a2
        .expect_ok(
            "workflow.complete_task",
            json!({
                "execution_id": execution_id,
                "step_id": "step2",
                "result": { "built": true },
            }),
        )
        .await;
    assert_eq!(execution["status"], "completed");
    assert_eq!(execution["step_results"]["step1"]["issues"], 3);
    assert_eq!(execution["step_results"]["step2"]["built"], true);
}

// ---------------------------------------------------------------------
// Rate limiting

#[tokio::test]
async fn rate_limit_rejects_the_overflowing_request_only() {
    let harness = TestHarness::rate_limited(100);
    let mut client = harness.connect("agent-a", "t1", &[]).await;

    let mut rejected = Vec::new();
    for i in 0..101 {
        let response = client
            .call("task.create", json!({ "task_type": format!("burst-{i}") }))
            .await;
        if let Some(error) = response.error {
            rejected.push((i, error));
        }
    }

    assert_eq!(rejected.len(), 1);
    let (index, error) = &rejected[0];
    assert_eq!(*index, 100);
    assert_eq!(error.code, 429);
    assert!(error.data.as_ref().unwrap()["retry_after"].as_u64().unwrap() > 0);

    // The rejected request never reached storage; a fresh session (with
    // its own bucket) sees exactly the hundred accepted tasks.
    let mut observer = harness.connect("agent-b", "t1", &[]).await;
    let listing = observer.expect_ok("task.list", json!({})).await;
    assert_eq!(listing["tasks"].as_array().unwrap().len(), 100);

    // The throttled session itself is still live.
    assert!(client.ctx.session.state().is_live());
}

// ---------------------------------------------------------------------
// Tenant isolation

#[tokio::test]
async fn cross_tenant_access_is_invisible() {
    let harness = TestHarness::new();
    let mut alpha = harness.connect("agent-a", "tenant-alpha", &[]).await;
    let mut beta = harness.connect("agent-b", "tenant-beta", &[]).await;

    let task = alpha
        .expect_ok("task.create", json!({ "task_type": "secret" }))
        .await;

    let response = beta
        .call("task.get", json!({ "task_id": task["id"] }))
        .await;
    // The other tenant learns nothing, not even existence.
    assert_eq!(response.error.unwrap().code, 404);

    let listing = beta.expect_ok("task.list", json!({})).await;
    assert!(listing["tasks"].as_array().unwrap().is_empty());
}

// ---------------------------------------------------------------------
// Tools

#[tokio::test]
async fn dynamic_tool_registration_and_execution() {
    let harness = TestHarness::new();
    let mut provider = harness.connect("tool-provider", "t1", &[]).await;
    let mut caller = harness.connect("agent-a", "t1", &[]).await;

    provider
        .expect_ok(
            "tool.register_dynamic",
            json!({ "name": "linter", "description": "lints code" }),
        )
        .await;

    let tools = caller.expect_ok("tool.list", json!({})).await;
    assert_eq!(tools["tools"][0]["name"], "linter");

    let health = caller
        .expect_ok("tool.check_health", json!({ "name": "linter" }))
        .await;
    assert_eq!(health["healthy"], true);

    let invocation = caller
        .expect_ok(
            "tool.execute",
            json!({ "name": "linter", "arguments": { "file": "main.rs" } }),
        )
        .await;
    assert_eq!(invocation["status"], "assigned");

    // The provider received the dispatched tool task.
    assert!(provider
        .drain_notifications()
        .iter()
        .any(|n| n.method.as_deref() == Some("task.assigned")));
}

// ---------------------------------------------------------------------
// Capability gating

#[tokio::test]
async fn missing_capability_is_forbidden() {
    let harness = TestHarness::new();
    let mut client = harness.connect("agent-a", "t1", &[]).await;
    client.ctx.principal.capabilities.clear();

    let response = client
        .call("task.create", json!({ "task_type": "work" }))
        .await;
    assert_eq!(response.error.unwrap().code, 403);
}
