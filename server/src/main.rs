use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;

use mesh_server::config::Config;
use mesh_server::runtime::Runtime;
use mesh_server::telemetry;

/// Multi-agent collaboration server.
#[derive(Parser, Debug)]
#[command(name = "mesh-server", version, about)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "CONFIG_FILE")]
    config: Option<String>,

    /// Override the listen address, e.g. 0.0.0.0:4000
    #[arg(short, long)]
    listen: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    if let Some(listen) = &cli.listen {
        let (addr, port) = listen
            .rsplit_once(':')
            .context("listen address must be host:port")?;
        config.server.listen_addr = addr.to_string();
        config.server.port = port.parse().context("invalid port")?;
    }
    config.validate()?;

    if cli.check_config {
        println!("configuration ok");
        return Ok(());
    }

    telemetry::init_telemetry(&config.logging)?;
    telemetry::log_startup_info(&config);

    let address = config.server_address();
    let runtime = Runtime::build(config);
    runtime.spawn_background();

    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;

    let serve = {
        let runtime = runtime.clone();
        tokio::spawn(async move { runtime.serve(listener).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    telemetry::log_shutdown_info();
    runtime.shutdown();

    let _ = serve.await;
    Ok(())
}
