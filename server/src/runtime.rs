//! Server runtime.
//!
//! Builds the shared state (clock, repositories, operation log, MVCC
//! store, engines, connection pool), wires the dispatcher, and runs the
//! session transport: a TCP accept loop where each connection performs a
//! handshake, then splits into a reader loop feeding the dispatcher and a
//! writer loop draining the session's outbound queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use mesh_core::clock::HybridLogicalClock;
use mesh_core::error::{MeshError, Result};
use mesh_core::mvcc::MvccStore;
use mesh_core::oplog::OperationLog;
use mesh_engine::distributed::ReducerRegistry;
use mesh_engine::document::DocumentService;
use mesh_engine::notify::NotificationSink;
use mesh_engine::recorder::AuditRecorder;
use mesh_engine::tasks::TaskEngine;
use mesh_engine::workflow::WorkflowExecutor;
use mesh_engine::workspace::WorkspaceService;
use mesh_protocol::frame::{FrameCodec, FrameHeader, WireFormat, FRAME_HEADER_LEN};
use mesh_protocol::message::{MessageKind, WireMessage};
use mesh_protocol::notifier::Notifier;
use mesh_protocol::pipeline::{Dispatcher, Principal, RequestContext};
use mesh_protocol::pool::ConnectionPool;
use mesh_protocol::session::{Session, SessionState};

use crate::config::Config;
use crate::handlers;
use crate::tools::ToolRegistry;

/// Bridges engine notifications onto the connection pool.
struct PoolSink {
    notifier: Notifier,
}

impl NotificationSink for PoolSink {
    fn notify_agent(&self, tenant_id: &str, agent_id: &str, method: &str, params: Value) -> usize {
        self.notifier
            .send_notification(tenant_id, agent_id, method, params)
    }

    fn broadcast(&self, topic: &str, method: &str, params: Value) -> usize {
        self.notifier.broadcast(topic, method, params)
    }
}

/// Everything the handlers share.
pub struct AppState {
    pub config: Config,
    pub clock: Arc<HybridLogicalClock>,
    pub repos: mesh_storage::Repositories,
    pub oplog: OperationLog,
    pub mvcc: MvccStore,
    pub pool: Arc<ConnectionPool>,
    pub notifier: Notifier,
    pub tasks: Arc<TaskEngine>,
    pub workflows: Arc<WorkflowExecutor>,
    pub workspaces: Arc<WorkspaceService>,
    pub documents: Arc<DocumentService>,
    pub tools: Arc<ToolRegistry>,
    pub started_at: Instant,
}

/// The assembled server.
pub struct Runtime {
    pub state: Arc<AppState>,
    pub dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
    codec: FrameCodec,
}

impl Runtime {
    /// Wire every component from configuration.
    pub fn build(config: Config) -> Arc<Self> {
        let clock = Arc::new(HybridLogicalClock::new(
            config.node.id.clone(),
            config.hlc.max_drift_ms,
        ));
        let repos = mesh_storage::Repositories::new();
        let oplog = OperationLog::new(clock.clone(), config.oplog_config());
        let mvcc = MvccStore::new(clock.clone());
        let pool = ConnectionPool::new(config.pool_config());
        let notifier = Notifier::new(pool.clone());
        let sink: Arc<dyn NotificationSink> = Arc::new(PoolSink {
            notifier: notifier.clone(),
        });
        let recorder = AuditRecorder::new(repos.audit.clone());

        let tasks = Arc::new(TaskEngine::new(
            repos.tasks.clone(),
            repos.agents.clone(),
            oplog.clone(),
            recorder.clone(),
            sink.clone(),
            clock.clone(),
            ReducerRegistry::new(),
            config.task_engine_config(),
        ));
        let workflows = WorkflowExecutor::new(
            repos.workflows.clone(),
            tasks.clone(),
            sink.clone(),
            recorder.clone(),
        );
        let workspaces = Arc::new(WorkspaceService::new(
            repos.workspaces.clone(),
            mvcc.clone(),
            oplog.clone(),
            recorder.clone(),
            sink.clone(),
            clock.clone(),
        ));
        let documents = Arc::new(DocumentService::new(
            repos.documents.clone(),
            oplog.clone(),
            recorder,
            sink,
            clock.clone(),
        ));
        let tools = Arc::new(ToolRegistry::new(tasks.clone(), pool.clone()));

        let codec = FrameCodec::new(config.oplog.compression_threshold);
        let state = Arc::new(AppState {
            clock,
            repos,
            oplog,
            mvcc,
            pool,
            notifier,
            tasks,
            workflows,
            workspaces,
            documents,
            tools,
            started_at: Instant::now(),
            config,
        });
        let dispatcher = Arc::new(handlers::build_dispatcher(state.clone()));

        Arc::new(Self {
            state,
            dispatcher,
            cancel: CancellationToken::new(),
            codec,
        })
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start the periodic background work: heartbeats, idle eviction,
    /// workflow timeouts, and garbage collection.
    pub fn spawn_background(&self) {
        self.state.pool.clone().spawn_heartbeat();
        self.state.pool.clone().spawn_idle_eviction();
        self.state.workflows.clone().spawn_timeout_sweep(
            Duration::from_secs(1),
            self.cancel.child_token(),
        );

        let state = self.state.clone();
        let cancel = self.cancel.child_token();
        let interval = Duration::from_secs(state.config.crdt.gc_interval_secs.max(1));
        let retention_ns = state.config.crdt.gc_retention_secs as i64 * 1_000_000_000;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let dropped = state.mvcc.gc(retention_ns);
                        let mut cutoff = state.clock.now();
                        cutoff.physical = cutoff.physical.saturating_sub(retention_ns);
                        let tombstones = state.documents.gc(&cutoff);
                        let gone = state.oplog.gc(&cutoff, &Default::default());
                        let flushed = state.oplog.flush();
                        debug!(dropped, tombstones, gone, flushed, "gc sweep done");
                    }
                }
            }
            debug!("gc sweep stopped");
        });
    }

    /// Cancel background work and close every session.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.state.pool.shutdown();
    }

    /// Accept connections until cancelled.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(addr = ?listener.local_addr().ok(), "session transport listening");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "connection accepted");
                            let runtime = self.clone();
                            tokio::spawn(async move {
                                if let Err(err) = runtime.handle_connection(stream).await {
                                    debug!(%err, "connection ended");
                                }
                            });
                        }
                        Err(err) => {
                            warn!(%err, "accept failed");
                        }
                    }
                }
            }
        }
    }

    /// Handshake, then run the reader and writer loops to completion.
    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        // The first message must be an `initialize` request.
        let first = self.read_message(&mut reader).await?;
        let (session, outbound_rx, response) = match self.handshake(&first) {
            Ok((session, rx)) => {
                let result = json!({
                    "session_id": session.id,
                    "server_version": env!("CARGO_PKG_VERSION"),
                    "node_id": self.state.config.node.id,
                });
                (session, rx, WireMessage::response(first.id.clone(), result))
            }
            Err(err) => {
                let denial = WireMessage::error_response(first.id.clone(), &err);
                let bytes = self.codec.encode_json(&denial)?;
                let _ = write_half.write_all(&bytes).await;
                return Err(err);
            }
        };

        let format = extract_format(&first);
        let bytes = self.codec.encode(&response, format)?;
        write_half
            .write_all(&bytes)
            .await
            .map_err(|e| MeshError::Internal(format!("handshake write failed: {e}")))?;

        let principal = Principal {
            agent_id: session.agent_id.clone(),
            tenant_id: session.tenant_id.clone(),
            capabilities: extract_capabilities(&first),
        };

        // Writer loop drains the session's outbound queue, replying in the
        // format the client negotiated. It holds only a weak handle so the
        // channel closes once the session is dropped.
        let writer_codec = self.codec;
        let writer_session = Arc::downgrade(&session);
        let writer = tokio::spawn(async move {
            let mut rx = outbound_rx;
            while let Some(msg) = rx.recv().await {
                let bytes = match writer_codec.encode(&msg, format) {
                    Ok(b) => b,
                    Err(err) => {
                        error!(%err, "outbound encode failed");
                        continue;
                    }
                };
                if write_half.write_all(&bytes).await.is_err() {
                    break;
                }
                if let Some(session) = writer_session.upgrade() {
                    session.touch_outbound(bytes.len() as u64);
                }
            }
        });

        let result = self.reader_loop(&mut reader, &session, principal).await;

        self.state.pool.remove(session.id);
        // Dropping the last session handle closes the outbound channel; the
        // writer drains whatever is still queued, then exits.
        drop(session);
        let _ = tokio::time::timeout(Duration::from_secs(5), writer).await;
        result
    }

    async fn reader_loop(
        &self,
        reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
        session: &Arc<Session>,
        principal: Principal,
    ) -> Result<()> {
        loop {
            if !session.state().is_live() {
                return Ok(());
            }
            let msg = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                msg = self.read_message(reader) => msg?,
            };
            session.touch_inbound(estimate_len(&msg));

            match msg.kind {
                MessageKind::Request => {
                    let ctx = RequestContext {
                        session: session.clone(),
                        principal: principal.clone(),
                    };
                    let response = self.dispatcher.dispatch(ctx, msg).await;
                    if session.try_enqueue(response).is_err() {
                        // Outbound backpressure: the session cannot keep
                        // up, close it.
                        warn!(session_id = %session.id, "outbound queue full, closing");
                        return Ok(());
                    }
                }
                MessageKind::Response => {
                    // Client answers to server pings land here.
                    session.record_pong();
                }
                MessageKind::Notification => {
                    if msg.method.as_deref() == Some("pong") {
                        session.record_pong();
                    }
                }
                MessageKind::Error => {
                    debug!(session_id = %session.id, "client error message ignored");
                }
            }
        }
    }

    /// Read one frame: a JSON line (default) or a binary envelope,
    /// discriminated by the first byte.
    async fn read_message(
        &self,
        reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
    ) -> Result<WireMessage> {
        let mut first = [0u8; 1];
        reader.read_exact(&mut first).await.map_err(io_closed)?;

        if first[0] == b'{' {
            let mut line = vec![first[0]];
            let mut byte = [0u8; 1];
            loop {
                reader
                    .read_exact(&mut byte)
                    .await
                    .map_err(io_closed)?;
                if byte[0] == b'\n' {
                    break;
                }
                line.push(byte[0]);
                if line.len() > 16 * 1024 * 1024 {
                    return Err(MeshError::InvalidParams("message too large".into()));
                }
            }
            self.codec.decode_json(&line)
        } else {
            let mut header_bytes = [0u8; FRAME_HEADER_LEN];
            header_bytes[0] = first[0];
            reader
                .read_exact(&mut header_bytes[1..])
                .await
                .map_err(io_closed)?;
            let header = FrameHeader::decode(&header_bytes)?;
            let mut payload = vec![0u8; header.payload_len as usize];
            reader.read_exact(&mut payload).await.map_err(io_closed)?;
            self.codec.decode_payload(&header, &payload)
        }
    }

    /// Validate the initialize request and admit the session.
    fn handshake(
        &self,
        msg: &WireMessage,
    ) -> Result<(Arc<Session>, mpsc::Receiver<WireMessage>)> {
        if msg.kind != MessageKind::Request || msg.method.as_deref() != Some("initialize") {
            return Err(MeshError::Unauthorized(
                "the first message must be an initialize request".into(),
            ));
        }
        let params = msg
            .params
            .as_ref()
            .and_then(|p| p.as_object())
            .ok_or_else(|| MeshError::InvalidParams("initialize needs params".into()))?;

        let agent_id = params
            .get("agent_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| MeshError::InvalidParams("agent_id is required".into()))?;
        let tenant_id = params
            .get("tenant_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| MeshError::InvalidParams("tenant_id is required".into()))?;
        let token = params
            .get("token")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        mesh_core::validation::validate_agent_id(agent_id)?;
        mesh_core::validation::validate_tenant_id(tenant_id)?;
        // Bearer credentials are validated out-of-band; here we only
        // require a plausible token shape.
        if token.len() < 10 {
            return Err(MeshError::Unauthorized("invalid bearer token".into()));
        }

        let (session, rx) = self.state.pool.register(agent_id, tenant_id)?;
        session.transition_to(SessionState::Authenticated)?;
        info!(session_id = %session.id, agent_id, tenant_id, "session authenticated");
        Ok((session, rx))
    }
}

fn extract_format(msg: &WireMessage) -> WireFormat {
    match msg
        .params
        .as_ref()
        .and_then(|p| p.get("format"))
        .and_then(|v| v.as_str())
    {
        Some("binary") => WireFormat::Binary,
        _ => WireFormat::Json,
    }
}

fn extract_capabilities(msg: &WireMessage) -> Vec<String> {
    msg.params
        .as_ref()
        .and_then(|p| p.get("capabilities"))
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

fn estimate_len(msg: &WireMessage) -> u64 {
    serde_json::to_vec(msg).map(|b| b.len() as u64).unwrap_or(0)
}

fn io_closed(e: std::io::Error) -> MeshError {
    debug!(err = %e, "transport closed");
    MeshError::ServiceUnavailable {
        retry_after_secs: 0,
    }
}
