//! Mesh server: configuration, telemetry, the handler table, and the
//! session transport runtime. The binary in `main.rs` is a thin wrapper
//! around [`runtime::Runtime`].

pub mod config;
pub mod handlers;
pub mod runtime;
pub mod telemetry;
pub mod tools;

pub use config::Config;
pub use runtime::{AppState, Runtime};
