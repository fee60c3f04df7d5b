//! The shipped configuration file loads and wires up.

use std::path::PathBuf;

use mcp_router_common::{BackendKind, LoadBalancePolicy, ProbeKind, RouterConfig};
use mcp_router_server::startup::{LogRotation, LogSettings, build_collaborators};

fn shipped_config() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../conf/application.yml")
}

#[test]
fn test_shipped_config_loads() {
    let config = RouterConfig::load(Some(&shipped_config())).unwrap();

    assert_eq!(config.registry.default_group, "mcp-server");
    assert_eq!(config.health.probe, ProbeKind::Http);
    assert_eq!(config.health.failure_threshold, 3);
    assert_eq!(config.router.policy, LoadBalancePolicy::First);
    assert_eq!(config.backend.kind, BackendKind::Memory);
    assert!(config.metrics.listen.is_none());
    assert_eq!(config.cache.retry_after_ms, 5000);

    assert_eq!(config.servers.len(), 1);
    let server = &config.servers[0];
    assert_eq!(server.name, "weather");
    assert_eq!(server.port, 8081);
    assert_eq!(server.tool_names(), "forecast");
}

#[test]
fn test_shipped_config_builds_collaborators() {
    let config = RouterConfig::load(Some(&shipped_config())).unwrap();
    let collaborators = build_collaborators(&config).unwrap();
    assert_eq!(collaborators.protocol.name(), "http");

    let settings = LogSettings::from_config(&config.logging, None);
    assert_eq!(settings.level, "info");
    assert!(settings.log_dir.is_none());
    assert!(settings.console_output);
    assert_eq!(settings.rotation, LogRotation::Daily);
}
