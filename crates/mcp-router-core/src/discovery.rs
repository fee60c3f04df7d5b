//! Healthy-instance lookup backed by the local cache
//!
//! Lookups never fail and never wait on the registry for longer than the
//! query timeout. A stale view, or an empty list, is returned instead.
//! Concurrent refreshes of one service share a single registry query, and a
//! failed query is not retried until `retry_after` has passed.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use mcp_router_api::{NamingClient, ServiceInstance, ServiceKey, WILDCARD};
use mcp_router_common::RouterError;
use tokio::sync::Mutex;
use tokio::time::{Instant, timeout};
use tracing::{debug, warn};

use crate::cache::InstanceCache;
use crate::subscriber::RegistrySubscriber;

const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(5);

pub struct ServiceDiscovery {
    naming: Arc<dyn NamingClient>,
    cache: Arc<InstanceCache>,
    subscriber: Arc<RegistrySubscriber>,
    query_timeout: Duration,
    service_groups: Vec<String>,
    retry_after: Duration,
    /// One refresh at a time per service
    refreshing: DashMap<ServiceKey, Arc<Mutex<()>>>,
    failed_at: DashMap<ServiceKey, Instant>,
}

impl ServiceDiscovery {
    pub fn new(
        naming: Arc<dyn NamingClient>,
        cache: Arc<InstanceCache>,
        subscriber: Arc<RegistrySubscriber>,
        query_timeout: Duration,
        service_groups: Vec<String>,
    ) -> Self {
        Self {
            naming,
            cache,
            subscriber,
            query_timeout,
            service_groups,
            retry_after: DEFAULT_RETRY_AFTER,
            refreshing: DashMap::new(),
            failed_at: DashMap::new(),
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn cache(&self) -> &Arc<InstanceCache> {
        &self.cache
    }

    pub fn service_groups(&self) -> &[String] {
        &self.service_groups
    }

    /// Healthy and enabled instances of `service_name` in `group`.
    ///
    /// `*` as service name fans out over every service; `*` as group means every
    /// configured group.
    pub async fn get_healthy_instances(
        &self,
        service_name: &str,
        group: &str,
    ) -> Vec<ServiceInstance> {
        if service_name == WILDCARD {
            return self.get_all_healthy(group).await;
        }
        if group == WILDCARD {
            let lookups = self
                .service_groups
                .iter()
                .map(|g| self.lookup(ServiceKey::new(service_name, g.clone())));
            return dedup_by_address(join_all(lookups).await.into_iter().flatten());
        }
        self.lookup(ServiceKey::new(service_name, group)).await
    }

    /// Query the registry ignoring the TTL and replace the cached view.
    ///
    /// A failure starts the `retry_after` window of the service.
    pub async fn refresh(&self, key: &ServiceKey) -> Result<Vec<ServiceInstance>, RouterError> {
        let result = match timeout(
            self.query_timeout,
            self.naming
                .list_instances(&key.service_name, &key.group, true),
        )
        .await
        {
            Ok(Ok(instances)) => Ok(instances),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(RouterError::Timeout(self.query_timeout)),
        };

        let instances = match result {
            Ok(instances) => instances,
            Err(e) => {
                self.failed_at.insert(key.clone(), Instant::now());
                return Err(e);
            }
        };

        self.failed_at.remove(key);
        let routable: Vec<_> = instances.into_iter().filter(|i| i.is_routable()).collect();
        self.cache.put(key.clone(), routable.clone());
        self.spawn_subscribe(key.clone());
        Ok(routable)
    }

    /// Whether a recent failed query still holds back a retry of `key`.
    pub fn is_backing_off(&self, key: &ServiceKey) -> bool {
        self.failed_at
            .get(key)
            .is_some_and(|at| at.elapsed() < self.retry_after)
    }

    async fn lookup(&self, key: ServiceKey) -> Vec<ServiceInstance> {
        if let Some(instances) = self.cache.get_fresh(&key) {
            return instances;
        }
        if self.is_backing_off(&key) {
            return self.cache.get_any(&key).unwrap_or_default();
        }

        let gate = self.refreshing.entry(key.clone()).or_default().clone();
        let _refreshing = gate.lock().await;

        // settled by the refresh we waited on
        if let Some(instances) = self.cache.get_fresh(&key) {
            return instances;
        }
        if self.is_backing_off(&key) {
            return self.cache.get_any(&key).unwrap_or_default();
        }

        match self.refresh(&key).await {
            Ok(instances) => {
                debug!("Refreshed {} from registry: {} instances", key, instances.len());
                instances
            }
            Err(e) => {
                let stale = self.cache.get_any(&key);
                warn!(
                    "Registry query for {} failed, serving {} cached instances for {:?}: {}",
                    key,
                    stale.as_ref().map_or(0, Vec::len),
                    self.retry_after,
                    e
                );
                stale.unwrap_or_default()
            }
        }
    }

    async fn get_all_healthy(&self, group: &str) -> Vec<ServiceInstance> {
        let groups: Vec<String> = if group == WILDCARD || group.is_empty() {
            self.service_groups.clone()
        } else {
            vec![group.to_string()]
        };

        let per_group = groups.iter().map(|g| self.get_group_healthy(g));
        dedup_by_address(join_all(per_group).await.into_iter().flatten())
    }

    async fn get_group_healthy(&self, group: &str) -> Vec<ServiceInstance> {
        let services = match timeout(self.query_timeout, self.naming.list_services(group)).await {
            Ok(Ok(services)) => services,
            Ok(Err(e)) => {
                warn!("Failed to list services of group {}: {}", group, e);
                self.cached_services(group)
            }
            Err(_) => {
                warn!("Listing services of group {} timed out", group);
                self.cached_services(group)
            }
        };

        let lookups = services
            .into_iter()
            .map(|service| self.lookup(ServiceKey::new(service, group)));
        join_all(lookups).await.into_iter().flatten().collect()
    }

    fn cached_services(&self, group: &str) -> Vec<String> {
        self.cache
            .keys()
            .into_iter()
            .filter(|k| k.group == group)
            .map(|k| k.service_name)
            .collect()
    }

    /// Watch the service from now on; the caller does not wait for it.
    fn spawn_subscribe(&self, key: ServiceKey) {
        if self.subscriber.is_subscribed(&key) {
            return;
        }
        let subscriber = self.subscriber.clone();
        tokio::spawn(async move {
            if let Err(e) = subscriber.ensure_subscribed(&key).await {
                debug!("Deferred subscription of {} failed: {}", key, e);
            }
        });
    }
}

/// Keep the first instance of every `host:port`.
fn dedup_by_address(instances: impl IntoIterator<Item = ServiceInstance>) -> Vec<ServiceInstance> {
    let mut seen = HashSet::new();
    instances
        .into_iter()
        .filter(|i| seen.insert(i.address()))
        .collect()
}
