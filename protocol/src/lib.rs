//! Session protocol for the agent mesh.
//!
//! Wire message shapes, the frame codec (JSON lines and the compact
//! binary envelope), managed sessions with per-session rate limiting and
//! circuit breaking, the connection pool, the middleware dispatch
//! pipeline, and notification fan-out.

pub mod breaker;
pub mod frame;
pub mod message;
pub mod notifier;
pub mod pipeline;
pub mod pool;
pub mod rate_limit;
pub mod session;

pub use breaker::{CircuitBreaker, CircuitState};
pub use frame::{FrameCodec, FrameHeader, WireFormat, FRAME_HEADER_LEN, FRAME_VERSION};
pub use message::{ErrorObject, MessageKind, WireMessage};
pub use notifier::{document_topic, task_topic, workflow_topic, workspace_topic, Notifier};
pub use pipeline::{
    handler_fn, Dispatcher, Handler, HandlerDescriptor, Principal, RequestContext,
};
pub use pool::{ConnectionPool, PoolConfig, PoolStats};
pub use rate_limit::{RateLimiter, TokenBucket};
pub use session::{Session, SessionState};
