//! In-process naming registry and config store
//!
//! Used by single-node deployments and tests. Subscribers are notified
//! synchronously, after the map guards are released, on every change.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use mcp_router_api::{
    ConfigClient, EventListener, NamingClient, NamingEvent, RemoteError, RemoteResult,
    ServiceInstance, ServiceKey,
};
use tracing::debug;

#[derive(Default)]
pub struct MemoryNamingClient {
    services: DashMap<ServiceKey, Vec<ServiceInstance>>,
    listeners: DashMap<ServiceKey, Arc<dyn EventListener>>,
}

impl MemoryNamingClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the registry-side health flag of one instance.
    pub fn set_healthy(&self, service_name: &str, group: &str, host: &str, port: u16, healthy: bool) -> bool {
        let key = ServiceKey::new(service_name, group);
        let changed = match self.services.get_mut(&key) {
            Some(mut instances) => instances
                .iter_mut()
                .find(|i| i.host == host && i.port == port)
                .map(|i| i.healthy = healthy)
                .is_some(),
            None => false,
        };
        if changed {
            self.notify(&key);
        }
        changed
    }

    pub fn instance_count(&self) -> usize {
        self.services.iter().map(|e| e.value().len()).sum()
    }

    fn snapshot(&self, key: &ServiceKey) -> Vec<ServiceInstance> {
        self.services
            .get(key)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    fn notify(&self, key: &ServiceKey) {
        let listener = self.listeners.get(key).map(|l| l.value().clone());
        if let Some(listener) = listener {
            let instances = self.snapshot(key);
            debug!("Notifying listener of {}: {} instances", key, instances.len());
            listener.on_event(NamingEvent {
                service_name: key.service_name.clone(),
                group: key.group.clone(),
                instances,
            });
        }
    }
}

#[async_trait]
impl NamingClient for MemoryNamingClient {
    async fn register(
        &self,
        service_name: &str,
        group: &str,
        instance: &ServiceInstance,
    ) -> RemoteResult<()> {
        let key = ServiceKey::new(service_name, group);
        let mut instance = instance.clone();
        instance.service_name = service_name.to_string();
        instance.group = group.to_string();
        instance.touch();

        {
            let mut instances = self.services.entry(key.clone()).or_default();
            match instances.iter_mut().find(|i| i.same_identity(&instance)) {
                Some(existing) => *existing = instance,
                None => instances.push(instance),
            }
        }
        self.notify(&key);
        Ok(())
    }

    async fn deregister(
        &self,
        service_name: &str,
        group: &str,
        host: &str,
        port: u16,
    ) -> RemoteResult<()> {
        let key = ServiceKey::new(service_name, group);
        let removed = match self.services.get_mut(&key) {
            Some(mut instances) => {
                let before = instances.len();
                instances.retain(|i| !(i.host == host && i.port == port));
                before != instances.len()
            }
            None => false,
        };
        if removed {
            self.services.remove_if(&key, |_, instances| instances.is_empty());
            self.notify(&key);
        }
        Ok(())
    }

    async fn list_instances(
        &self,
        service_name: &str,
        group: &str,
        healthy_only: bool,
    ) -> RemoteResult<Vec<ServiceInstance>> {
        Ok(self
            .snapshot(&ServiceKey::new(service_name, group))
            .into_iter()
            .filter(|i| !healthy_only || i.healthy)
            .collect())
    }

    async fn subscribe(
        &self,
        service_name: &str,
        group: &str,
        listener: Arc<dyn EventListener>,
    ) -> RemoteResult<()> {
        self.listeners
            .insert(ServiceKey::new(service_name, group), listener);
        Ok(())
    }

    async fn unsubscribe(&self, service_name: &str, group: &str) -> RemoteResult<()> {
        self.listeners.remove(&ServiceKey::new(service_name, group));
        Ok(())
    }

    async fn list_services(&self, group: &str) -> RemoteResult<Vec<String>> {
        let mut services: Vec<String> = self
            .services
            .iter()
            .filter(|e| e.key().group == group && !e.value().is_empty())
            .map(|e| e.key().service_name.clone())
            .collect();
        services.sort();
        Ok(services)
    }

    async fn heartbeat(
        &self,
        service_name: &str,
        group: &str,
        instance: &ServiceInstance,
    ) -> RemoteResult<()> {
        let key = ServiceKey::new(service_name, group);
        let mut instances = self
            .services
            .get_mut(&key)
            .ok_or_else(|| RemoteError::NotFound(key.to_string()))?;
        let existing = instances
            .iter_mut()
            .find(|i| i.same_identity(instance))
            .ok_or_else(|| RemoteError::NotFound(instance.key().to_string()))?;
        existing.touch();
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryConfigClient {
    entries: DashMap<(String, String), String>,
}

impl MemoryConfigClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, data_id: &str, group: &str) -> bool {
        self.entries
            .contains_key(&(data_id.to_string(), group.to_string()))
    }
}

#[async_trait]
impl ConfigClient for MemoryConfigClient {
    async fn publish(&self, data_id: &str, group: &str, content: &str) -> RemoteResult<bool> {
        self.entries
            .insert((data_id.to_string(), group.to_string()), content.to_string());
        Ok(true)
    }

    async fn get(&self, data_id: &str, group: &str) -> RemoteResult<Option<String>> {
        Ok(self
            .entries
            .get(&(data_id.to_string(), group.to_string()))
            .map(|v| v.value().clone()))
    }

    async fn delete(&self, data_id: &str, group: &str) -> RemoteResult<bool> {
        Ok(self
            .entries
            .remove(&(data_id.to_string(), group.to_string()))
            .is_some())
    }
}
