//! Domain engines for the agent mesh: task lifecycle, workflow execution,
//! workspaces, and shared documents, all built over the `mesh-core`
//! repository traits and state machinery.

pub mod distributed;
pub mod document;
pub mod notify;
pub mod recorder;
pub mod retry;
pub mod selection;
pub mod tasks;
pub mod workflow;
pub mod workspace;

pub use distributed::{aggregate, CustomReducer, ReducerRegistry, PARTIAL_FAILURE_FIELD};
pub use document::DocumentService;
pub use notify::{NoopSink, NotificationSink, RecordingSink};
pub use recorder::AuditRecorder;
pub use retry::{backoff_delay, RetryPolicy};
pub use selection::{AgentSelector, SelectionCriteria, SelectionPolicy};
pub use tasks::{TaskEngine, TaskEngineConfig, CAP_DELEGATE_ANY};
pub use workflow::WorkflowExecutor;
pub use workspace::{StateUpdate, WorkspaceService};
