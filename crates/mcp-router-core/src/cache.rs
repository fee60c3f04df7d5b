//! TTL-bounded local view of registry instances, keyed by `(service, group)`

use std::collections::HashMap;
use std::time::Duration;

use dashmap::DashMap;
use mcp_router_api::{InstanceKey, ServiceInstance, ServiceKey};
use tokio::time::Instant;
use tracing::debug;

/// Cached instance list of one service
#[derive(Clone, Debug)]
pub struct CachedServiceView {
    pub instances: Vec<ServiceInstance>,
    pub fetched_at: Instant,
}

impl CachedServiceView {
    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }

    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.age() < ttl
    }
}

/// Local instance cache.
///
/// A view older than the TTL is stale: `get_fresh` ignores it, while `get_any`
/// still serves it as a fallback.
pub struct InstanceCache {
    ttl: Duration,
    views: DashMap<ServiceKey, CachedServiceView>,
}

impl InstanceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            views: DashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get_fresh(&self, key: &ServiceKey) -> Option<Vec<ServiceInstance>> {
        self.views
            .get(key)
            .filter(|view| view.is_fresh(self.ttl))
            .map(|view| view.instances.clone())
    }

    pub fn get_any(&self, key: &ServiceKey) -> Option<Vec<ServiceInstance>> {
        self.views.get(key).map(|view| view.instances.clone())
    }

    pub fn view(&self, key: &ServiceKey) -> Option<CachedServiceView> {
        self.views.get(key).map(|view| view.clone())
    }

    /// Replace the view of `key`. Entries sharing an identity tuple collapse
    /// into the last one.
    pub fn put(&self, key: ServiceKey, instances: Vec<ServiceInstance>) {
        let instances = dedup_by_identity(instances);
        debug!("Cache updated: service={}, instances={}", key, instances.len());
        self.views.insert(
            key,
            CachedServiceView {
                instances,
                fetched_at: Instant::now(),
            },
        );
    }

    pub fn remove(&self, key: &ServiceKey) -> Option<CachedServiceView> {
        self.views.remove(key).map(|(_, view)| view)
    }

    pub fn keys(&self) -> Vec<ServiceKey> {
        self.views.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Every cached instance across all views, stale ones included
    pub fn all_instances(&self) -> Vec<ServiceInstance> {
        self.views
            .iter()
            .flat_map(|entry| entry.value().instances.clone())
            .collect()
    }

    /// Names of services with at least one cached instance
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .views
            .iter()
            .filter(|entry| !entry.value().instances.is_empty())
            .map(|entry| entry.key().service_name.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn clear(&self) {
        self.views.clear();
    }
}

fn dedup_by_identity(instances: Vec<ServiceInstance>) -> Vec<ServiceInstance> {
    let mut positions: HashMap<InstanceKey, usize> = HashMap::with_capacity(instances.len());
    let mut result: Vec<ServiceInstance> = Vec::with_capacity(instances.len());

    for instance in instances {
        match positions.get(&instance.key()) {
            Some(&pos) => result[pos] = instance,
            None => {
                positions.insert(instance.key(), result.len());
                result.push(instance);
            }
        }
    }

    result
}
