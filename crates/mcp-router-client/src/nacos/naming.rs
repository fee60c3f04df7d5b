//! Naming client over `/v1/ns`
//!
//! The v1 API has no push channel, so `subscribe` starts a polling watcher per
//! service that calls the listener whenever the instance list changes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use mcp_router_api::{
    EventListener, NamingClient, NamingEvent, RemoteResult, ServiceInstance, ServiceKey,
};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::grouped_service_name;
use crate::error::{ClientError, Result};
use crate::http::NacosHttpClient;

const INSTANCE_PATH: &str = "/v1/ns/instance";
const INSTANCE_LIST_PATH: &str = "/v1/ns/instance/list";
const INSTANCE_BEAT_PATH: &str = "/v1/ns/instance/beat";
const SERVICE_LIST_PATH: &str = "/v1/ns/service/list";
const SERVICE_PAGE_SIZE: usize = 500;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct InstanceListResponse {
    hosts: Vec<HostEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HostEntry {
    ip: String,
    port: u16,
    #[serde(default = "default_weight")]
    weight: f64,
    #[serde(default = "default_true")]
    healthy: bool,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default = "default_true")]
    ephemeral: bool,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

fn default_weight() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

impl HostEntry {
    fn into_instance(self, service_name: &str, group: &str) -> ServiceInstance {
        let mut instance = ServiceInstance::new(service_name, group, self.ip, self.port);
        instance.weight = self.weight;
        instance.healthy = self.healthy;
        instance.enabled = self.enabled;
        instance.ephemeral = self.ephemeral;
        instance.metadata = self.metadata;
        instance
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ServiceListResponse {
    count: usize,
    doms: Vec<String>,
}

pub struct NacosNamingClient {
    http: Arc<NacosHttpClient>,
    namespace: String,
    watch_interval: Duration,
    watchers: DashMap<ServiceKey, JoinHandle<()>>,
}

impl NacosNamingClient {
    pub fn new(http: Arc<NacosHttpClient>, namespace: &str, watch_interval: Duration) -> Self {
        Self {
            http,
            namespace: namespace.to_string(),
            watch_interval,
            watchers: DashMap::new(),
        }
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }

    async fn do_register(&self, service_name: &str, group: &str, instance: &ServiceInstance) -> Result<()> {
        let metadata = serde_json::to_string(&instance.metadata).map_err(anyhow::Error::from)?;
        let form = [
            ("serviceName", service_name.to_string()),
            ("groupName", group.to_string()),
            ("namespaceId", self.namespace.clone()),
            ("ip", instance.host.clone()),
            ("port", instance.port.to_string()),
            ("weight", instance.weight.to_string()),
            ("enabled", instance.enabled.to_string()),
            ("healthy", instance.healthy.to_string()),
            ("ephemeral", instance.ephemeral.to_string()),
            ("metadata", metadata),
        ];
        let body = self.http.post_form(INSTANCE_PATH, &form).await?;
        expect_ok(INSTANCE_PATH, &body)
    }

    async fn do_deregister(&self, service_name: &str, group: &str, host: &str, port: u16) -> Result<()> {
        let query = [
            ("serviceName", service_name.to_string()),
            ("groupName", group.to_string()),
            ("namespaceId", self.namespace.clone()),
            ("ip", host.to_string()),
            ("port", port.to_string()),
            ("ephemeral", "true".to_string()),
        ];
        let body = self.http.delete_with_query(INSTANCE_PATH, &query).await?;
        expect_ok(INSTANCE_PATH, &body)
    }

    async fn do_list_services(&self, group: &str) -> Result<Vec<String>> {
        let mut services = Vec::new();
        let mut page = 1;
        loop {
            let query = [
                ("pageNo", page.to_string()),
                ("pageSize", SERVICE_PAGE_SIZE.to_string()),
                ("groupName", group.to_string()),
                ("namespaceId", self.namespace.clone()),
            ];
            let response: ServiceListResponse =
                self.http.get_json(SERVICE_LIST_PATH, &query).await?;
            let received = response.doms.len();
            services.extend(response.doms);

            if received < SERVICE_PAGE_SIZE || services.len() >= response.count {
                break;
            }
            page += 1;
        }
        Ok(services)
    }

    async fn do_heartbeat(&self, service_name: &str, group: &str, instance: &ServiceInstance) -> Result<()> {
        let beat = serde_json::json!({
            "serviceName": grouped_service_name(group, service_name),
            "ip": instance.host,
            "port": instance.port,
            "weight": instance.weight,
            "metadata": instance.metadata,
        });
        let form = [
            ("serviceName", service_name.to_string()),
            ("groupName", group.to_string()),
            ("namespaceId", self.namespace.clone()),
            ("beat", beat.to_string()),
        ];
        self.http.put_form(INSTANCE_BEAT_PATH, &form).await?;
        Ok(())
    }
}

/// `/v1/ns/instance` answers `ok` on success.
fn expect_ok(path: &str, body: &str) -> Result<()> {
    if body.trim().eq_ignore_ascii_case("ok") {
        Ok(())
    } else {
        Err(ClientError::InvalidResponse(format!("{} returned {}", path, body)))
    }
}

async fn fetch_instances(
    http: &NacosHttpClient,
    namespace: &str,
    service_name: &str,
    group: &str,
    healthy_only: bool,
) -> Result<Vec<ServiceInstance>> {
    let query = [
        ("serviceName", service_name.to_string()),
        ("groupName", group.to_string()),
        ("namespaceId", namespace.to_string()),
        ("healthyOnly", healthy_only.to_string()),
    ];
    let response: InstanceListResponse = http.get_json(INSTANCE_LIST_PATH, &query).await?;
    let mut instances: Vec<ServiceInstance> = response
        .hosts
        .into_iter()
        .map(|h| h.into_instance(service_name, group))
        .collect();
    instances.sort_by(|a, b| (&a.host, a.port).cmp(&(&b.host, b.port)));
    Ok(instances)
}

/// Poll one service and report every change to `listener`.
async fn watch(
    http: Arc<NacosHttpClient>,
    namespace: String,
    key: ServiceKey,
    interval: Duration,
    listener: Arc<dyn EventListener>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last: Option<Vec<ServiceInstance>> = None;

    loop {
        ticker.tick().await;
        match fetch_instances(&http, &namespace, &key.service_name, &key.group, false).await {
            Ok(instances) => {
                if last.as_ref() == Some(&instances) {
                    continue;
                }
                debug!("Service {} changed: {} instances", key, instances.len());
                listener.on_event(NamingEvent {
                    service_name: key.service_name.clone(),
                    group: key.group.clone(),
                    instances: instances.clone(),
                });
                last = Some(instances);
            }
            Err(e) => debug!("Polling {} failed: {}", key, e),
        }
    }
}

#[async_trait]
impl NamingClient for NacosNamingClient {
    async fn register(
        &self,
        service_name: &str,
        group: &str,
        instance: &ServiceInstance,
    ) -> RemoteResult<()> {
        Ok(self.do_register(service_name, group, instance).await?)
    }

    async fn deregister(
        &self,
        service_name: &str,
        group: &str,
        host: &str,
        port: u16,
    ) -> RemoteResult<()> {
        Ok(self.do_deregister(service_name, group, host, port).await?)
    }

    async fn list_instances(
        &self,
        service_name: &str,
        group: &str,
        healthy_only: bool,
    ) -> RemoteResult<Vec<ServiceInstance>> {
        Ok(fetch_instances(&self.http, &self.namespace, service_name, group, healthy_only).await?)
    }

    async fn subscribe(
        &self,
        service_name: &str,
        group: &str,
        listener: Arc<dyn EventListener>,
    ) -> RemoteResult<()> {
        let key = ServiceKey::new(service_name, group);
        let handle = tokio::spawn(watch(
            self.http.clone(),
            self.namespace.clone(),
            key.clone(),
            self.watch_interval,
            listener,
        ));
        if let Some(previous) = self.watchers.insert(key.clone(), handle) {
            previous.abort();
        }
        info!("Watching {} every {:?}", key, self.watch_interval);
        Ok(())
    }

    async fn unsubscribe(&self, service_name: &str, group: &str) -> RemoteResult<()> {
        if let Some((key, handle)) = self.watchers.remove(&ServiceKey::new(service_name, group)) {
            handle.abort();
            info!("Stopped watching {}", key);
        }
        Ok(())
    }

    async fn list_services(&self, group: &str) -> RemoteResult<Vec<String>> {
        Ok(self.do_list_services(group).await?)
    }

    async fn heartbeat(
        &self,
        service_name: &str,
        group: &str,
        instance: &ServiceInstance,
    ) -> RemoteResult<()> {
        Ok(self.do_heartbeat(service_name, group, instance).await?)
    }
}

impl Drop for NacosNamingClient {
    fn drop(&mut self) {
        for watcher in self.watchers.iter() {
            watcher.value().abort();
        }
        if !self.watchers.is_empty() {
            warn!("Naming client dropped with {} active watchers", self.watchers.len());
        }
    }
}
