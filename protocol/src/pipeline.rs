//! Request dispatch pipeline.
//!
//! Handlers are data: a method name maps to a descriptor carrying the
//! required capabilities, timeout, rate bucket, and the invoke function.
//! Dispatch applies the middleware in a fixed outer-to-inner order (trace,
//! metrics, audit, authorization, rate limit, circuit breaker, validation,
//! recovery, timeout); the first layer to fail short-circuits the layers
//! inside it while the outer layers still observe the outcome.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use tracing::{debug, error, info_span, Instrument};

use mesh_core::error::{MeshError, Result};

use crate::message::WireMessage;
use crate::session::Session;

/// The authenticated identity bound to a session at handshake.
#[derive(Debug, Clone)]
pub struct Principal {
    pub agent_id: String,
    pub tenant_id: String,
    pub capabilities: Vec<String>,
}

impl Principal {
    /// Capability check. The `admin` capability satisfies everything.
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability || c == "admin")
    }
}

/// Everything a handler needs about the calling session.
#[derive(Clone)]
pub struct RequestContext {
    pub session: Arc<Session>,
    pub principal: Principal,
}

/// A method implementation.
pub trait Handler: Send + Sync {
    fn invoke(&self, ctx: RequestContext, params: Value) -> BoxFuture<'static, Result<Value>>;
}

struct FnHandler<F> {
    f: F,
}

impl<F> Handler for FnHandler<F>
where
    F: Fn(RequestContext, Value) -> BoxFuture<'static, Result<Value>> + Send + Sync,
{
    fn invoke(&self, ctx: RequestContext, params: Value) -> BoxFuture<'static, Result<Value>> {
        (self.f)(ctx, params)
    }
}

/// Wrap an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(RequestContext, Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler {
        f: move |ctx, params| f(ctx, params).boxed(),
    })
}

/// Per-method dispatch contract.
#[derive(Clone)]
pub struct HandlerDescriptor {
    pub method: String,
    pub required_capabilities: Vec<String>,
    pub timeout: Duration,
    pub rate_bucket: String,
    /// State-changing methods are refused while the node is read-only
    pub mutating: bool,
    pub handler: Arc<dyn Handler>,
}

impl HandlerDescriptor {
    pub fn new(method: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        Self {
            method: method.into(),
            required_capabilities: Vec::new(),
            timeout: Duration::from_secs(30),
            rate_bucket: "default".to_string(),
            mutating: false,
            handler,
        }
    }

    pub fn requires(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.push(capability.into());
        self
    }

    pub fn mutating(mut self) -> Self {
        self.mutating = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_rate_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.rate_bucket = bucket.into();
        self
    }
}

#[derive(Debug, Default)]
struct MethodMetrics {
    calls: AtomicU64,
    errors: AtomicU64,
    total_micros: AtomicU64,
}

/// Aggregate dispatch counters, observable per method.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    by_method: DashMap<String, MethodMetrics>,
}

impl DispatchMetrics {
    fn observe(&self, method: &str, elapsed: Duration, failed: bool) {
        let entry = self.by_method.entry(method.to_string()).or_default();
        entry.calls.fetch_add(1, Ordering::Relaxed);
        entry
            .total_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        if failed {
            entry.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn calls(&self, method: &str) -> u64 {
        self.by_method
            .get(method)
            .map(|m| m.calls.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn errors(&self, method: &str) -> u64 {
        self.by_method
            .get(method)
            .map(|m| m.errors.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

/// The dispatcher: the method table plus the middleware chain.
pub struct Dispatcher {
    handlers: HashMap<String, HandlerDescriptor>,
    metrics: DispatchMetrics,
    /// When this reports true, mutating methods fail with
    /// `ServiceUnavailable` (degraded read-only mode after clock drift)
    read_only: Option<Arc<dyn Fn() -> bool + Send + Sync>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            metrics: DispatchMetrics::default(),
            read_only: None,
        }
    }

    pub fn set_read_only_gate(&mut self, gate: Arc<dyn Fn() -> bool + Send + Sync>) {
        self.read_only = Some(gate);
    }

    pub fn register(&mut self, descriptor: HandlerDescriptor) {
        self.handlers.insert(descriptor.method.clone(), descriptor);
    }

    pub fn methods(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    pub fn metrics(&self) -> &DispatchMetrics {
        &self.metrics
    }

    /// Run one request through the pipeline and produce the response
    /// message. Never panics outward; the recovery layer converts handler
    /// panics into internal errors.
    pub async fn dispatch(&self, ctx: RequestContext, msg: WireMessage) -> WireMessage {
        let id = msg.id.clone();
        let method = match &msg.method {
            Some(m) if msg.is_request() => m.clone(),
            _ => {
                return WireMessage::error_response(
                    id,
                    &MeshError::InvalidParams("expected a request with a method".into()),
                );
            }
        };

        let descriptor = match self.handlers.get(&method) {
            Some(d) => d.clone(),
            None => {
                return WireMessage::error_response(
                    id,
                    &MeshError::not_found("method", &method),
                );
            }
        };

        // Trace wraps everything below it.
        let span = info_span!(
            "dispatch",
            method = %method,
            tenant_id = %ctx.principal.tenant_id,
            agent_id = %ctx.principal.agent_id,
            session_id = %ctx.session.id,
        );

        let start = Instant::now();
        let outcome = self
            .run_inner(&descriptor, ctx.clone(), msg.params.unwrap_or(Value::Null))
            .instrument(span)
            .await;

        // Metrics and audit observe every outcome, including rejections
        // from the layers below them.
        let elapsed = start.elapsed();
        self.metrics.observe(&method, elapsed, outcome.is_err());
        match &outcome {
            Ok(_) => {
                debug!(method = %method, elapsed_ms = elapsed.as_millis() as u64, "request ok")
            }
            Err(err) => {
                debug!(method = %method, %err, elapsed_ms = elapsed.as_millis() as u64, "request failed")
            }
        }

        // The breaker counts server-side outcomes only; client mistakes do
        // not poison the session.
        let server_failure = matches!(
            &outcome,
            Err(MeshError::Internal(_))
                | Err(MeshError::ServiceUnavailable { .. })
                | Err(MeshError::Timeout(_))
        );
        ctx.session.record_outcome(!server_failure);

        match outcome {
            Ok(result) => WireMessage::response(id, result),
            Err(err) => WireMessage::error_response(id, &err),
        }
    }

    /// Layers 4..9: authorization, rate limit, breaker, validation,
    /// recovery, timeout, then the handler itself.
    async fn run_inner(
        &self,
        descriptor: &HandlerDescriptor,
        ctx: RequestContext,
        params: Value,
    ) -> Result<Value> {
        for capability in &descriptor.required_capabilities {
            if !ctx.principal.has_capability(capability) {
                return Err(MeshError::missing_capability(capability));
            }
        }

        if descriptor.mutating {
            if let Some(read_only) = &self.read_only {
                if read_only() {
                    return Err(MeshError::ServiceUnavailable {
                        retry_after_secs: 30,
                    });
                }
            }
        }

        ctx.session.check_rate(&descriptor.rate_bucket)?;
        ctx.session.check_breaker()?;

        if !params.is_null() && !params.is_object() {
            return Err(MeshError::InvalidParams(
                "params must be an object".into(),
            ));
        }

        let invocation = AssertUnwindSafe(descriptor.handler.invoke(ctx, params)).catch_unwind();
        match tokio::time::timeout(descriptor.timeout, invocation).await {
            Err(_) => Err(MeshError::Timeout(format!(
                "'{}' exceeded {}s",
                descriptor.method,
                descriptor.timeout.as_secs()
            ))),
            Ok(Err(panic)) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(method = %descriptor.method, %detail, "handler panicked");
                Err(MeshError::Internal(format!(
                    "handler '{}' panicked",
                    descriptor.method
                )))
            }
            Ok(Ok(result)) => result,
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
