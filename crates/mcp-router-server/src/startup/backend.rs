//! Collaborator wiring from the `backend` and `health` sections

use std::sync::Arc;

use anyhow::Context;
use mcp_router_api::{ConfigClient, NamingClient, ProtocolClient};
use mcp_router_client::{
    HttpClientConfig, HttpProtocolClient, MemoryConfigClient, MemoryNamingClient,
    NacosConfigClient, NacosHttpClient, NacosNamingClient, TcpProtocolClient,
};
use mcp_router_common::{BackendKind, ProbeKind, RouterConfig};
use tracing::info;

/// The external collaborators handed to `McpRegistry::new`.
pub struct Collaborators {
    pub naming: Arc<dyn NamingClient>,
    pub config: Arc<dyn ConfigClient>,
    pub protocol: Arc<dyn ProtocolClient>,
}

pub fn build_collaborators(config: &RouterConfig) -> anyhow::Result<Collaborators> {
    let (naming, config_client): (Arc<dyn NamingClient>, Arc<dyn ConfigClient>) =
        match config.backend.kind {
            BackendKind::Memory => {
                info!("Using the in-process naming registry and config store");
                (
                    Arc::new(MemoryNamingClient::new()),
                    Arc::new(MemoryConfigClient::new()),
                )
            }
            BackendKind::Nacos => {
                let backend = &config.backend;
                let remote_timeout_ms = config.registry.remote_timeout_ms;
                let http_config = HttpClientConfig::with_servers(backend.server_addrs.clone())
                    .with_auth(&backend.username, &backend.password)
                    .with_timeouts(remote_timeout_ms, remote_timeout_ms)
                    .with_context_path(&backend.context_path);
                let http = Arc::new(
                    NacosHttpClient::new(http_config).context("Failed to create registry client")?,
                );

                info!(
                    "Using Nacos-compatible backend: servers={:?}, namespace={}",
                    backend.server_addrs, config.registry.namespace
                );
                (
                    Arc::new(NacosNamingClient::new(
                        http.clone(),
                        &config.registry.namespace,
                        backend.watch_interval(),
                    )),
                    Arc::new(NacosConfigClient::new(http, &config.registry.namespace)),
                )
            }
        };

    let protocol: Arc<dyn ProtocolClient> = match config.health.probe {
        ProbeKind::Http => Arc::new(
            HttpProtocolClient::new(config.health.probe_timeout())
                .context("Failed to create HTTP probe client")?,
        ),
        ProbeKind::Tcp => Arc::new(TcpProtocolClient::new(config.health.probe_timeout())),
    };

    Ok(Collaborators {
        naming,
        config: config_client,
        protocol,
    })
}
