//! Shared helpers for the registry integration tests

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashSet;
use mcp_router_api::{
    ConfigClient, ProtocolClient, ProtocolSession, RemoteError, RemoteResult, ServiceInstance,
};
use mcp_router_client::{MemoryConfigClient, MemoryNamingClient};
use mcp_router_common::RouterConfig;
use mcp_router_core::McpRegistry;

/// Config store that refuses publishes to selected groups
#[derive(Default)]
pub struct FlakyConfigStore {
    inner: MemoryConfigClient,
    refused_groups: DashSet<String>,
}

impl FlakyConfigStore {
    pub fn refuse(&self, group: &str) {
        self.refused_groups.insert(group.to_string());
    }

    pub fn accept_all(&self) {
        self.refused_groups.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

#[async_trait]
impl ConfigClient for FlakyConfigStore {
    async fn publish(&self, data_id: &str, group: &str, content: &str) -> RemoteResult<bool> {
        if self.refused_groups.contains(group) {
            return Err(RemoteError::Unavailable(format!("{} is read-only", group)));
        }
        self.inner.publish(data_id, group, content).await
    }

    async fn get(&self, data_id: &str, group: &str) -> RemoteResult<Option<String>> {
        self.inner.get(data_id, group).await
    }

    async fn delete(&self, data_id: &str, group: &str) -> RemoteResult<bool> {
        self.inner.delete(data_id, group).await
    }
}

/// Protocol client whose reachability is switched per `host:port`
#[derive(Default)]
pub struct SwitchableProtocol {
    down: DashSet<String>,
}

impl SwitchableProtocol {
    pub fn set_down(&self, address: &str, down: bool) {
        if down {
            self.down.insert(address.to_string());
        } else {
            self.down.remove(address);
        }
    }
}

struct Session;

#[async_trait]
impl ProtocolSession for Session {
    async fn ping(&mut self) -> RemoteResult<()> {
        Ok(())
    }

    async fn close(self: Box<Self>) {}
}

#[async_trait]
impl ProtocolClient for SwitchableProtocol {
    async fn connect(&self, instance: &ServiceInstance) -> RemoteResult<Box<dyn ProtocolSession>> {
        if self.down.contains(&instance.address()) {
            return Err(RemoteError::Unavailable("connection refused".into()));
        }
        Ok(Box::new(Session))
    }

    fn name(&self) -> &str {
        "switchable"
    }
}

pub struct Harness {
    pub registry: McpRegistry,
    pub naming: Arc<MemoryNamingClient>,
    pub config: Arc<FlakyConfigStore>,
    pub protocol: Arc<SwitchableProtocol>,
}

/// Registry over in-memory collaborators with manual health probing.
pub fn harness() -> Harness {
    let mut config = RouterConfig::default();
    config.health.enabled = false;
    config.audit.enabled = false;
    config.registry.service_groups = vec!["grp".to_string()];
    harness_with(config)
}

pub fn harness_with(config: RouterConfig) -> Harness {
    let naming = Arc::new(MemoryNamingClient::new());
    let config_store = Arc::new(FlakyConfigStore::default());
    let protocol = Arc::new(SwitchableProtocol::default());
    let registry = McpRegistry::new(config, naming.clone(), config_store.clone(), protocol.clone());
    Harness {
        registry,
        naming,
        config: config_store,
        protocol,
    }
}
