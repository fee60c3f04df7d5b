//! Naming registry contract consumed by the router core

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::RemoteResult;
use crate::model::ServiceInstance;

/// Change notification for one watched `(service, group)`.
///
/// `instances` is the full current instance list, not a delta.
#[derive(Clone, Debug)]
pub struct NamingEvent {
    pub service_name: String,
    pub group: String,
    pub instances: Vec<ServiceInstance>,
}

/// Receives instance-list changes of a subscribed service.
///
/// Called from the registry backend's own context, so implementations must not block.
pub trait EventListener: Send + Sync + 'static {
    fn on_event(&self, event: NamingEvent);
}

/// A listener that invokes a closure.
pub struct FnEventListener<F>
where
    F: Fn(NamingEvent) + Send + Sync + 'static,
{
    f: F,
}

impl<F> FnEventListener<F>
where
    F: Fn(NamingEvent) + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> EventListener for FnEventListener<F>
where
    F: Fn(NamingEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: NamingEvent) {
        (self.f)(event);
    }
}

/// Service-discovery backend (Nacos-like).
#[async_trait]
pub trait NamingClient: Send + Sync {
    /// Upsert an instance keyed by `(service, group, host, port)`.
    async fn register(
        &self,
        service_name: &str,
        group: &str,
        instance: &ServiceInstance,
    ) -> RemoteResult<()>;

    async fn deregister(
        &self,
        service_name: &str,
        group: &str,
        host: &str,
        port: u16,
    ) -> RemoteResult<()>;

    async fn list_instances(
        &self,
        service_name: &str,
        group: &str,
        healthy_only: bool,
    ) -> RemoteResult<Vec<ServiceInstance>>;

    async fn subscribe(
        &self,
        service_name: &str,
        group: &str,
        listener: Arc<dyn EventListener>,
    ) -> RemoteResult<()>;

    async fn unsubscribe(&self, service_name: &str, group: &str) -> RemoteResult<()>;

    /// Service names known in `group`
    async fn list_services(&self, group: &str) -> RemoteResult<Vec<String>>;

    /// Keep an ephemeral instance alive; backends without leases accept it as a no-op.
    async fn heartbeat(
        &self,
        _service_name: &str,
        _group: &str,
        _instance: &ServiceInstance,
    ) -> RemoteResult<()> {
        Ok(())
    }
}
