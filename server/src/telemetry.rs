use anyhow::{Context, Result};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry,
};

use crate::config::{LogFormat, LoggingConfig};

/// Initialize the tracing subscriber for logging and telemetry.
pub fn init_telemetry(config: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .context("Invalid log level configuration")?;

    let registry = Registry::default().with(env_filter);

    match config.format {
        LogFormat::Pretty => {
            let fmt_layer = fmt::layer()
                .pretty()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true);
            registry.with(fmt_layer).init();
        }
        LogFormat::Json => {
            let fmt_layer = fmt::layer()
                .json()
                .with_target(true)
                .with_span_list(true)
                .flatten_event(true);
            registry.with(fmt_layer).init();
        }
        LogFormat::Compact => {
            let fmt_layer = fmt::layer()
                .compact()
                .with_target(true)
                .with_file(false)
                .with_line_number(false);
            registry.with(fmt_layer).init();
        }
    }

    tracing::info!(
        log_level = %config.level,
        log_format = ?config.format,
        "Telemetry initialized"
    );
    Ok(())
}

/// Log server startup information.
pub fn log_startup_info(config: &crate::config::Config) {
    tracing::info!(
        server_address = %config.server_address(),
        node_id = %config.node.id,
        max_connections = config.pool.max_connections,
        "Mesh server starting up"
    );
}

/// Log server shutdown information.
pub fn log_shutdown_info() {
    tracing::info!("Mesh server shutting down gracefully");
}
