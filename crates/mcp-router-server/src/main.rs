//! Main entry point of the MCP router daemon.

use std::path::PathBuf;

use clap::Parser;
use mcp_router_common::RouterConfig;
use mcp_router_core::McpRegistry;
use mcp_router_server::startup::{self, LogSettings};
use tracing::info;

#[derive(Debug, Parser)]
#[command(version, about = "MCP server registry, health monitoring and routing")]
struct Cli {
    /// Configuration file (defaults to conf/application.yml when present)
    #[arg(short = 'c', long = "config", env = "MCP_ROUTER_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter directive, overrides `logging.level`
    #[arg(long = "log-level")]
    log_level: Option<String>,

    /// Leave owned registrations in the registry on exit
    #[arg(long = "keep-registrations")]
    keep_registrations: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = RouterConfig::load(cli.config.as_deref())?;

    let log_settings = LogSettings::from_config(&config.logging, cli.log_level.as_deref());
    let _logging_guard = startup::init_logging(&log_settings)?;

    startup::init_metrics(config.metrics.listen.as_deref())?;

    let collaborators = startup::build_collaborators(&config)?;
    let servers = config.servers.clone();
    let registry = McpRegistry::new(
        config,
        collaborators.naming,
        collaborators.config,
        collaborators.protocol,
    );
    registry.start();

    let registered = startup::register_servers(&registry, &servers).await;
    info!(
        "MCP router started: {}/{} configured servers registered",
        registered,
        servers.len()
    );

    startup::wait_for_shutdown_signal().await;

    registry.shutdown(!cli.keep_registrations).await;
    info!("MCP router stopped");

    Ok(())
}
