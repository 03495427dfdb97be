//! In-process test harness for end-to-end scenarios.
//!
//! Builds the full runtime (storage, engines, pool, dispatcher) without a
//! TCP listener; clients are sessions registered straight into the pool,
//! and calls go through the real dispatch pipeline.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use mesh_core::models::AgentProfile;
use mesh_core::repository::AgentRepository;
use mesh_protocol::message::WireMessage;
use mesh_protocol::pipeline::{Principal, RequestContext};
use mesh_protocol::session::SessionState;
use mesh_server::config::Config;
use mesh_server::runtime::Runtime;

/// A fully wired in-process server.
pub struct TestHarness {
    pub runtime: Arc<Runtime>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            runtime: Runtime::build(config),
        }
    }

    /// Config tuned so rate-limit tests are deterministic: a burst budget
    /// with negligible refill.
    pub fn rate_limited(capacity: u32) -> Self {
        let mut config = Config::default();
        config.pool.rate_capacity = capacity;
        config.pool.rate_refill_per_sec = 1;
        Self::with_config(config)
    }

    /// Register the agent and open a session for it.
    pub async fn connect(
        &self,
        agent_id: &str,
        tenant_id: &str,
        agent_capabilities: &[&str],
    ) -> TestClient {
        let state = &self.runtime.state;
        // Agents may reconnect; only the first registration counts.
        let _ = state
            .repos
            .agents
            .register(
                AgentProfile::new(agent_id, tenant_id).with_capabilities(
                    agent_capabilities.iter().map(|c| c.to_string()).collect(),
                ),
            )
            .await;

        let (session, rx) = state
            .pool
            .register(agent_id, tenant_id)
            .expect("pool admission");
        session
            .transition_to(SessionState::Authenticated)
            .expect("authenticated");

        TestClient {
            runtime: self.runtime.clone(),
            ctx: RequestContext {
                session,
                principal: Principal {
                    agent_id: agent_id.to_string(),
                    tenant_id: tenant_id.to_string(),
                    capabilities: vec!["mesh:read".to_string(), "mesh:write".to_string()],
                },
            },
            rx,
            next_id: 0,
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// One connected agent session.
pub struct TestClient {
    runtime: Arc<Runtime>,
    pub ctx: RequestContext,
    rx: mpsc::Receiver<WireMessage>,
    next_id: u64,
}

impl TestClient {
    pub fn agent_id(&self) -> &str {
        &self.ctx.principal.agent_id
    }

    /// Issue a request through the full pipeline.
    pub async fn call(&mut self, method: &str, params: Value) -> WireMessage {
        self.next_id += 1;
        let msg = WireMessage::request(format!("r{}", self.next_id), method, params);
        self.runtime.dispatcher.dispatch(self.ctx.clone(), msg).await
    }

    /// Like [`TestClient::call`] but panics on an error response and
    /// returns the result value.
    pub async fn expect_ok(&mut self, method: &str, params: Value) -> Value {
        let response = self.call(method, params).await;
        if let Some(error) = &response.error {
            panic!("{method} failed: {} {}", error.code, error.message);
        }
        response.result.expect("result present")
    }

    /// Drain every notification currently queued for this session.
    pub fn drain_notifications(&mut self) -> Vec<WireMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = self.rx.try_recv() {
            if msg.method.as_deref() != Some("ping") {
                out.push(msg);
            }
        }
        out
    }

    /// Grant an extra capability to this client's principal.
    pub fn grant(&mut self, capability: &str) {
        self.ctx.principal.capabilities.push(capability.to_string());
    }
}
