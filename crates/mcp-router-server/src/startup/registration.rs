use mcp_router_api::McpServerInfo;
use mcp_router_core::McpRegistry;
use tracing::{error, info};

/// Register every configured server; failures are logged and skipped.
///
/// Returns the number of servers registered.
pub async fn register_servers(registry: &McpRegistry, servers: &[McpServerInfo]) -> usize {
    let mut registered = 0;
    for server in servers {
        match registry.register_server(server).await {
            Ok(instance) => {
                registered += 1;
                info!(
                    "Registered configured server: service={}, address={}",
                    instance.service_name,
                    instance.address()
                );
            }
            Err(e) => error!(
                "Failed to register configured server: service={}, address={}:{}, {}",
                server.name, server.host, server.port, e
            ),
        }
    }
    registered
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use mcp_router_api::ToolDefinition;
    use mcp_router_client::{MemoryConfigClient, MemoryNamingClient, TcpProtocolClient};
    use mcp_router_common::RouterConfig;

    fn registry() -> McpRegistry {
        let mut config = RouterConfig::default();
        config.health.enabled = false;
        config.audit.enabled = false;
        McpRegistry::new(
            config,
            Arc::new(MemoryNamingClient::new()),
            Arc::new(MemoryConfigClient::new()),
            Arc::new(TcpProtocolClient::default()),
        )
    }

    #[tokio::test]
    async fn test_invalid_servers_are_skipped() {
        let registry = registry();
        let servers = vec![
            McpServerInfo::new("weather", "10.0.0.1", 8080)
                .with_tool(ToolDefinition::new("forecast", "Daily forecast")),
            McpServerInfo::new("broken", "10.0.0.2", 0),
            McpServerInfo::new("search", "10.0.0.3", 9000),
        ];

        assert_eq!(register_servers(&registry, &servers).await, 2);
        assert_eq!(registry.registrar().registered().len(), 2);

        let selected = registry.select_instance("weather", "mcp-server").await.unwrap();
        assert_eq!(selected.address(), "10.0.0.1:8080");
    }

    #[tokio::test]
    async fn test_no_servers() {
        assert_eq!(register_servers(&registry(), &[]).await, 0);
    }
}
