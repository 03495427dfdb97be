use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use mesh_core::mvcc::IsolationLevel;
use mesh_engine::tasks::TaskEngineConfig;
use mesh_protocol::pool::PoolConfig;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub node: NodeConfig,
    pub hlc: HlcConfig,
    pub pool: PoolSettings,
    pub handler: HandlerConfig,
    pub crdt: CrdtConfig,
    pub oplog: OplogSettings,
    pub mvcc: MvccConfig,
    pub task: TaskSettings,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    /// Listen address for the session transport
    pub listen_addr: String,
    /// Port number to listen on
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: LogFormat,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
    Compact,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NodeConfig {
    /// Stable node id used by the hybrid logical clock
    pub id: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HlcConfig {
    /// Largest tolerated clock drift from a peer, in milliseconds
    pub max_drift_ms: i64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PoolSettings {
    pub max_connections: usize,
    pub max_per_tenant: usize,
    pub max_per_agent: usize,
    pub idle_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub max_ping_failures: u32,
    /// Default per-session rate bucket
    pub rate_capacity: u32,
    pub rate_refill_per_sec: u32,
    pub outbound_queue: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HandlerConfig {
    pub default_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CrdtConfig {
    pub gc_interval_secs: u64,
    pub gc_retention_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct OplogSettings {
    pub compression_threshold: usize,
    pub sync_writes: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MvccConfig {
    /// read_committed, repeatable_read, or serializable
    pub default_isolation: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TaskSettings {
    pub max_retries_cap: u32,
    pub max_delegation_depth: u32,
}

impl Config {
    /// Load configuration from the embedded defaults, an optional config
    /// file, and environment variable overrides.
    pub fn from_env() -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        // Start with default configuration
        builder = builder.add_source(File::from_str(
            include_str!("../config/default.toml"),
            FileFormat::Toml,
        ));

        // Add config file if specified
        if let Ok(config_file) = env::var("CONFIG_FILE") {
            builder = builder.add_source(
                File::with_name(&config_file)
                    .required(false)
                    .format(FileFormat::Toml),
            );
        }

        // Add environment variable overrides with MESH__ prefix; the
        // double separator keeps snake_case keys intact.
        builder = builder.add_source(
            Environment::with_prefix("MESH")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        let mut result: Config = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        // Standard environment variables override for deployment ease.
        Self::apply_standard_env_vars(&mut result);

        Ok(result)
    }

    /// Load configuration from a specific file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let builder = ConfigBuilder::builder()
            .add_source(File::from_str(
                include_str!("../config/default.toml"),
                FileFormat::Toml,
            ))
            .add_source(File::with_name(path).format(FileFormat::Toml))
            .add_source(
                Environment::with_prefix("MESH")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder
            .build()
            .context("Failed to build configuration from file")?;

        let mut result: Config = config
            .try_deserialize()
            .context("Failed to deserialize configuration from file")?;
        Self::apply_standard_env_vars(&mut result);
        Ok(result)
    }

    fn apply_standard_env_vars(config: &mut Config) {
        if let Ok(listen_addr) = env::var("LISTEN_ADDR") {
            config.server.listen_addr = listen_addr;
        }
        if let Ok(log_level) = env::var("LOG_LEVEL") {
            config.logging.level = log_level;
        }
        if let Ok(node_id) = env::var("NODE_ID") {
            config.node.id = node_id;
        }
    }

    /// Get the server socket address.
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.listen_addr, self.server.port)
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.pool.max_connections,
            max_per_tenant: self.pool.max_per_tenant,
            max_per_agent: self.pool.max_per_agent,
            idle_timeout: Duration::from_secs(self.pool.idle_timeout_secs),
            ping_interval: Duration::from_secs(self.pool.ping_interval_secs),
            max_ping_failures: self.pool.max_ping_failures,
            rate_capacity: self.pool.rate_capacity,
            rate_refill_per_sec: self.pool.rate_refill_per_sec,
            outbound_queue: self.pool.outbound_queue,
        }
    }

    pub fn oplog_config(&self) -> mesh_core::oplog::OplogConfig {
        mesh_core::oplog::OplogConfig {
            compression_threshold: self.oplog.compression_threshold,
            sync_writes: self.oplog.sync_writes,
        }
    }

    pub fn task_engine_config(&self) -> TaskEngineConfig {
        TaskEngineConfig {
            max_retries_cap: self.task.max_retries_cap,
            max_delegation_depth: self.task.max_delegation_depth,
            ..Default::default()
        }
    }

    pub fn default_isolation(&self) -> Result<IsolationLevel> {
        self.mvcc
            .default_isolation
            .parse()
            .map_err(|e| anyhow::anyhow!("{e}"))
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler.default_timeout_secs)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(anyhow::anyhow!(
                    "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    self.logging.level
                ));
            }
        }

        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }
        if self.node.id.trim().is_empty() {
            return Err(anyhow::anyhow!("Node id cannot be empty"));
        }
        if self.hlc.max_drift_ms <= 0 {
            return Err(anyhow::anyhow!("hlc.max_drift_ms must be positive"));
        }
        if self.pool.max_connections == 0 {
            return Err(anyhow::anyhow!("pool.max_connections must be positive"));
        }
        if self.task.max_retries_cap > mesh_core::validation::MAX_RETRIES_CAP {
            return Err(anyhow::anyhow!(
                "task.max_retries_cap cannot exceed {}",
                mesh_core::validation::MAX_RETRIES_CAP
            ));
        }
        self.default_isolation()?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        // The embedded defaults always parse; a failure here is a build
        // defect caught by the tests below.
        let config = ConfigBuilder::builder()
            .add_source(File::from_str(
                include_str!("../config/default.toml"),
                FileFormat::Toml,
            ))
            .build()
            .and_then(|c| c.try_deserialize())
            .expect("embedded default configuration is valid");
        config
    }
}
