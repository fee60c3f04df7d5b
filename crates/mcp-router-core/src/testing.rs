//! In-crate fakes of the collaborator contracts for unit tests

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use mcp_router_api::{
    ConfigClient, EventListener, NamingClient, NamingEvent, ProtocolClient, ProtocolSession,
    RemoteError, RemoteResult, ServiceInstance, ServiceKey,
};
use parking_lot::Mutex;

#[derive(Default)]
pub struct FakeNaming {
    instances: DashMap<ServiceKey, Vec<ServiceInstance>>,
    listeners: DashMap<ServiceKey, Arc<dyn EventListener>>,
    subscribe_calls: AtomicUsize,
    list_calls: AtomicUsize,
    register_calls: AtomicUsize,
    heartbeat_calls: AtomicUsize,
    fail_subscribe: AtomicBool,
    fail_list: AtomicBool,
    fail_deregister: AtomicBool,
    fail_register_times: AtomicU32,
    list_delay: Mutex<Option<Duration>>,
}

impl FakeNaming {
    pub fn set_instances(&self, service: &str, group: &str, instances: Vec<ServiceInstance>) {
        self.instances
            .insert(ServiceKey::new(service, group), instances);
    }

    pub fn push(&self, event: NamingEvent) {
        let key = ServiceKey::new(event.service_name.clone(), event.group.clone());
        let listener = self.listeners.get(&key).map(|l| l.value().clone());
        if let Some(listener) = listener {
            listener.on_event(event);
        }
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn register_calls(&self) -> usize {
        self.register_calls.load(Ordering::SeqCst)
    }

    pub fn heartbeat_calls(&self) -> usize {
        self.heartbeat_calls.load(Ordering::SeqCst)
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_deregister(&self, fail: bool) {
        self.fail_deregister.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `times` register calls
    pub fn fail_next_registers(&self, times: u32) {
        self.fail_register_times.store(times, Ordering::SeqCst);
    }

    pub fn set_list_delay(&self, delay: Option<Duration>) {
        *self.list_delay.lock() = delay;
    }

    pub fn registered(&self, service: &str, group: &str) -> Vec<ServiceInstance> {
        self.instances
            .get(&ServiceKey::new(service, group))
            .map(|v| v.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl NamingClient for FakeNaming {
    async fn register(
        &self,
        service_name: &str,
        group: &str,
        instance: &ServiceInstance,
    ) -> RemoteResult<()> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_register_times.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_register_times.store(remaining - 1, Ordering::SeqCst);
            return Err(RemoteError::Unavailable("registry down".into()));
        }

        let mut entry = self
            .instances
            .entry(ServiceKey::new(service_name, group))
            .or_default();
        entry.retain(|i| !i.same_identity(instance));
        entry.push(instance.clone());
        Ok(())
    }

    async fn deregister(
        &self,
        service_name: &str,
        group: &str,
        host: &str,
        port: u16,
    ) -> RemoteResult<()> {
        if self.fail_deregister.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("registry down".into()));
        }
        if let Some(mut entry) = self.instances.get_mut(&ServiceKey::new(service_name, group)) {
            entry.retain(|i| !(i.host == host && i.port == port));
        }
        Ok(())
    }

    async fn list_instances(
        &self,
        service_name: &str,
        group: &str,
        healthy_only: bool,
    ) -> RemoteResult<Vec<ServiceInstance>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.list_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("registry down".into()));
        }
        Ok(self
            .registered(service_name, group)
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
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("registry down".into()));
        }
        self.listeners
            .insert(ServiceKey::new(service_name, group), listener);
        Ok(())
    }

    async fn unsubscribe(&self, service_name: &str, group: &str) -> RemoteResult<()> {
        self.listeners.remove(&ServiceKey::new(service_name, group));
        Ok(())
    }

    async fn list_services(&self, group: &str) -> RemoteResult<Vec<String>> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("registry down".into()));
        }
        Ok(self
            .instances
            .iter()
            .filter(|e| e.key().group == group)
            .map(|e| e.key().service_name.clone())
            .collect())
    }

    async fn heartbeat(
        &self,
        _service_name: &str,
        _group: &str,
        _instance: &ServiceInstance,
    ) -> RemoteResult<()> {
        self.heartbeat_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeConfig {
    entries: DashMap<(String, String), String>,
    /// Groups whose publish is refused
    fail_groups: DashMap<String, ()>,
    fail_deletes: AtomicBool,
    pub published: Mutex<Vec<(String, String)>>,
    pub deleted: Mutex<Vec<(String, String)>>,
}

impl FakeConfig {
    pub fn fail_publish_in(&self, group: &str) {
        self.fail_groups.insert(group.to_string(), ());
    }

    pub fn clear_failures(&self) {
        self.fail_groups.clear();
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn contains(&self, data_id: &str, group: &str) -> bool {
        self.entries
            .contains_key(&(data_id.to_string(), group.to_string()))
    }

    pub fn content(&self, data_id: &str, group: &str) -> Option<String> {
        self.entries
            .get(&(data_id.to_string(), group.to_string()))
            .map(|v| v.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[async_trait]
impl ConfigClient for FakeConfig {
    async fn publish(&self, data_id: &str, group: &str, content: &str) -> RemoteResult<bool> {
        if self.fail_groups.contains_key(group) {
            return Err(RemoteError::Rejected {
                code: 500,
                message: format!("publish to {} refused", group),
            });
        }
        self.entries
            .insert((data_id.to_string(), group.to_string()), content.to_string());
        self.published
            .lock()
            .push((data_id.to_string(), group.to_string()));
        Ok(true)
    }

    async fn get(&self, data_id: &str, group: &str) -> RemoteResult<Option<String>> {
        Ok(self.content(data_id, group))
    }

    async fn delete(&self, data_id: &str, group: &str) -> RemoteResult<bool> {
        self.deleted
            .lock()
            .push((data_id.to_string(), group.to_string()));
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("config store down".into()));
        }
        Ok(self
            .entries
            .remove(&(data_id.to_string(), group.to_string()))
            .is_some())
    }
}

/// Protocol fake whose reachability is toggled per `host:port`
#[derive(Default)]
pub struct FakeProtocol {
    down: DashMap<String, ()>,
    connect_delay: Mutex<Option<Duration>>,
    connects: AtomicUsize,
}

impl FakeProtocol {
    pub fn set_reachable(&self, address: &str, reachable: bool) {
        if reachable {
            self.down.remove(address);
        } else {
            self.down.insert(address.to_string(), ());
        }
    }

    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        *self.connect_delay.lock() = delay;
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

struct FakeSession;

#[async_trait]
impl ProtocolSession for FakeSession {
    async fn ping(&mut self) -> RemoteResult<()> {
        Ok(())
    }

    async fn close(self: Box<Self>) {}
}

#[async_trait]
impl ProtocolClient for FakeProtocol {
    async fn connect(&self, instance: &ServiceInstance) -> RemoteResult<Box<dyn ProtocolSession>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *self.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.down.contains_key(&instance.address()) {
            return Err(RemoteError::Unavailable(format!(
                "connection refused: {}",
                instance.address()
            )));
        }
        Ok(Box::new(FakeSession))
    }

    fn name(&self) -> &str {
        "fake"
    }
}
