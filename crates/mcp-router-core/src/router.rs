//! Instance selection
//!
//! The router reads the instance cache and the circuit breakers, drops instances
//! of services whose breaker is open and instances that probing marked
//! unhealthy, then applies the load-balancing policy.
//! Selection is bounded by `select_timeout`; past it the stale cache answers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use mcp_router_api::{ServiceInstance, ServiceKey, WILDCARD};
use mcp_router_common::config::RouterSettings;
use mcp_router_common::{LoadBalancePolicy, Result, RouterError};
use rand::Rng;
use serde::Serialize;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditSink, now_millis};
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::discovery::ServiceDiscovery;
use crate::health::HealthMonitor;

/// Smoothing factor of the response time average
const RESPONSE_TIME_ALPHA: f64 = 0.3;

/// Active connection counts, consulted by least-connections routing.
pub trait ConnectionCounter: Send + Sync {
    fn active_connections(&self, address: &str) -> usize;
}

/// In-process connection counter keyed by `host:port`.
#[derive(Default)]
pub struct ConnectionTracker {
    counts: DashMap<String, AtomicUsize>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, address: &str) -> usize {
        self.counts
            .entry(address.to_string())
            .or_default()
            .fetch_add(1, Ordering::SeqCst)
            + 1
    }

    pub fn release(&self, address: &str) {
        if let Some(count) = self.counts.get(address) {
            let _ = count.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1));
        }
    }
}

impl ConnectionCounter for ConnectionTracker {
    fn active_connections(&self, address: &str) -> usize {
        self.counts
            .get(address)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct LoadCounters {
    selections: u64,
    successes: u64,
    errors: u64,
    avg_response_time: Option<Duration>,
}

/// Load seen by one instance through this router
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InstanceLoadStats {
    pub address: String,
    pub selections: u64,
    pub successes: u64,
    pub errors: u64,
    pub active_connections: usize,
    /// Moving average of reported response times, else the last probe duration
    pub response_time_ms: Option<u64>,
}

/// Snapshot of the router's load balancing
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LoadBalancerStats {
    pub policy: LoadBalancePolicy,
    pub total_selections: u64,
    pub instances: Vec<InstanceLoadStats>,
}

pub struct Router {
    discovery: Arc<ServiceDiscovery>,
    breakers: Arc<CircuitBreakerRegistry>,
    audit: Arc<dyn AuditSink>,
    settings: RouterSettings,
    connections: Option<Arc<dyn ConnectionCounter>>,
    health: Option<Arc<HealthMonitor>>,
    cursors: DashMap<ServiceKey, AtomicUsize>,
    /// Current weights of smooth weighted round robin, by address
    smooth_weights: DashMap<ServiceKey, HashMap<String, f64>>,
    load: DashMap<String, LoadCounters>,
}

impl Router {
    pub fn new(
        discovery: Arc<ServiceDiscovery>,
        breakers: Arc<CircuitBreakerRegistry>,
        audit: Arc<dyn AuditSink>,
        settings: RouterSettings,
    ) -> Self {
        Self {
            discovery,
            breakers,
            audit,
            settings,
            connections: None,
            health: None,
            cursors: DashMap::new(),
            smooth_weights: DashMap::new(),
            load: DashMap::new(),
        }
    }

    pub fn with_connection_counter(mut self, connections: Arc<dyn ConnectionCounter>) -> Self {
        self.connections = Some(connections);
        self
    }

    /// Skip instances the monitor marked unhealthy and use its probe durations
    /// for fastest-response routing.
    pub fn with_health_monitor(mut self, health: Arc<HealthMonitor>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn policy(&self) -> LoadBalancePolicy {
        self.settings.policy
    }

    /// Select an instance with the configured policy.
    pub async fn select_instance(&self, service_name: &str, group: &str) -> Result<ServiceInstance> {
        self.select_with_policy(service_name, group, self.settings.policy)
            .await
    }

    pub async fn select_with_policy(
        &self,
        service_name: &str,
        group: &str,
        policy: LoadBalancePolicy,
    ) -> Result<ServiceInstance> {
        let started = Instant::now();
        let key = ServiceKey::new(service_name, group);

        let candidates = match timeout(
            self.settings.select_timeout(),
            self.candidates(service_name, group),
        )
        .await
        {
            Ok(candidates) => candidates,
            Err(_) => {
                warn!(
                    "Instance lookup for {} exceeded {:?}, using cached instances",
                    key,
                    self.settings.select_timeout()
                );
                self.cached_candidates(service_name, group)
            }
        };

        let total = candidates.len();
        let closed: Vec<ServiceInstance> = candidates
            .into_iter()
            .filter(|i| !self.breakers.is_open(&i.service_name))
            .collect();
        if closed.len() < total {
            debug!(
                "Skipped {} instances behind open circuits for {}",
                total - closed.len(),
                key
            );
        }

        let probed = closed.len();
        let routable: Vec<ServiceInstance> = closed
            .into_iter()
            .filter(|i| !self.is_marked_unhealthy(i))
            .collect();
        if routable.len() < probed {
            debug!(
                "Skipped {} instances marked unhealthy for {}",
                probed - routable.len(),
                key
            );
        }

        let result = self
            .pick(&key, &routable, policy)
            .ok_or_else(|| RouterError::NoHealthyInstance(service_name.to_string()));

        let elapsed = started.elapsed();
        let outcome = match &result {
            Ok(_) => "selected",
            Err(_) => "no_healthy_instance",
        };
        metrics::counter!("mcp_router_route_total", "outcome" => outcome).increment(1);
        metrics::histogram!("mcp_router_route_latency_ms").record(elapsed.as_secs_f64() * 1000.0);

        if let Ok(instance) = &result {
            self.load.entry(instance.address()).or_default().selections += 1;
        }

        match &result {
            Ok(instance) => debug!(
                "Selected {} for {} by {} in {:?}",
                instance.address(),
                key,
                policy,
                elapsed
            ),
            Err(_) => info!("No healthy instance for {}", key),
        }

        self.audit.emit(AuditEvent::Routing {
            service: service_name.to_string(),
            group: group.to_string(),
            policy: policy.to_string(),
            selected: result.as_ref().ok().map(ServiceInstance::address),
            outcome: outcome.to_string(),
            duration_ms: elapsed.as_millis() as u64,
            timestamp: now_millis(),
        });

        result
    }

    /// Report the outcome of a call routed to `address`.
    pub fn record_response(&self, address: &str, elapsed: Duration, success: bool) {
        let mut counters = self.load.entry(address.to_string()).or_default();
        if success {
            counters.successes += 1;
        } else {
            counters.errors += 1;
        }
        counters.avg_response_time = Some(match counters.avg_response_time {
            Some(avg) => avg.mul_f64(1.0 - RESPONSE_TIME_ALPHA) + elapsed.mul_f64(RESPONSE_TIME_ALPHA),
            None => elapsed,
        });
    }

    /// Per-instance selection counts, reported outcomes and response times.
    pub fn stats(&self) -> LoadBalancerStats {
        let mut instances: Vec<InstanceLoadStats> = self
            .load
            .iter()
            .map(|entry| InstanceLoadStats {
                address: entry.key().clone(),
                selections: entry.selections,
                successes: entry.successes,
                errors: entry.errors,
                active_connections: self
                    .connections
                    .as_ref()
                    .map_or(0, |c| c.active_connections(entry.key())),
                response_time_ms: entry.avg_response_time.map(|d| d.as_millis() as u64),
            })
            .collect();
        instances.sort_by(|a, b| a.address.cmp(&b.address));

        LoadBalancerStats {
            policy: self.settings.policy,
            total_selections: instances.iter().map(|i| i.selections).sum(),
            instances,
        }
    }

    fn is_marked_unhealthy(&self, instance: &ServiceInstance) -> bool {
        self.health
            .as_ref()
            .is_some_and(|health| health.is_unhealthy(&instance.key()))
    }

    /// Reported average when calls were recorded, else the last probe duration.
    fn response_time(&self, instance: &ServiceInstance) -> Option<Duration> {
        let address = instance.address();
        let reported = self
            .load
            .get(&address)
            .and_then(|counters| counters.avg_response_time);
        reported.or_else(|| {
            self.health
                .as_ref()
                .and_then(|health| health.response_time(&instance.key()))
        })
    }

    async fn candidates(&self, service_name: &str, group: &str) -> Vec<ServiceInstance> {
        let instances = self
            .discovery
            .get_healthy_instances(service_name, group)
            .await;
        if !instances.is_empty()
            || !self.settings.smart_routing
            || service_name == WILDCARD
            || group == WILDCARD
        {
            return instances;
        }

        for other in self.discovery.service_groups() {
            if other == group {
                continue;
            }
            let instances = self
                .discovery
                .get_healthy_instances(service_name, other)
                .await;
            if !instances.is_empty() {
                info!(
                    "Smart routing found {} in group {} instead of {}",
                    service_name, other, group
                );
                return instances;
            }
        }

        Vec::new()
    }

    fn cached_candidates(&self, service_name: &str, group: &str) -> Vec<ServiceInstance> {
        let cache = self.discovery.cache();
        if let Some(instances) = cache.get_any(&ServiceKey::new(service_name, group)) {
            if !instances.is_empty() || !self.settings.smart_routing {
                return instances;
            }
        }
        if !self.settings.smart_routing {
            return Vec::new();
        }
        self.discovery
            .service_groups()
            .iter()
            .filter_map(|g| cache.get_any(&ServiceKey::new(service_name, g.clone())))
            .find(|instances| !instances.is_empty())
            .unwrap_or_default()
    }

    /// Apply `policy` to `candidates`. `None` only when `candidates` is empty.
    pub fn pick(
        &self,
        key: &ServiceKey,
        candidates: &[ServiceInstance],
        policy: LoadBalancePolicy,
    ) -> Option<ServiceInstance> {
        if candidates.is_empty() {
            return None;
        }

        let index = match policy {
            LoadBalancePolicy::First => 0,
            LoadBalancePolicy::RoundRobin => self.next_cursor(key, candidates.len()),
            LoadBalancePolicy::Random => rand::rng().random_range(0..candidates.len()),
            LoadBalancePolicy::WeightedRandom => match weighted_index(candidates) {
                Some(index) => index,
                None => self.next_cursor(key, candidates.len()),
            },
            LoadBalancePolicy::LeastConnections => match &self.connections {
                Some(connections) => least_connections_index(candidates, connections.as_ref()),
                None => 0,
            },
            LoadBalancePolicy::WeightedRoundRobin => match self.smooth_weighted_index(key, candidates) {
                Some(index) => index,
                None => self.next_cursor(key, candidates.len()),
            },
            LoadBalancePolicy::FastestResponse => self.fastest_index(candidates),
        };

        candidates.get(index).cloned()
    }

    fn next_cursor(&self, key: &ServiceKey, len: usize) -> usize {
        self.cursors
            .entry(key.clone())
            .or_default()
            .fetch_add(1, Ordering::Relaxed)
            % len
    }

    /// Smooth weighted round robin: every candidate gains its weight, the
    /// largest current weight wins and pays back the total. `None` when no
    /// weight is positive.
    fn smooth_weighted_index(&self, key: &ServiceKey, candidates: &[ServiceInstance]) -> Option<usize> {
        let mut current = self.smooth_weights.entry(key.clone()).or_default();
        let addresses: HashSet<String> = candidates.iter().map(ServiceInstance::address).collect();
        current.retain(|address, _| addresses.contains(address));

        let mut total = 0.0;
        let mut best: Option<(usize, f64)> = None;
        for (index, instance) in candidates.iter().enumerate() {
            if !is_positive_weight(instance.weight) {
                continue;
            }
            let weight = current.entry(instance.address()).or_insert(0.0);
            *weight += instance.weight;
            total += instance.weight;
            if best.is_none_or(|(_, top)| *weight > top) {
                best = Some((index, *weight));
            }
        }

        let (index, _) = best?;
        if let Some(weight) = current.get_mut(&candidates[index].address()) {
            *weight -= total;
        }
        Some(index)
    }

    /// Lowest known response time wins; unmeasured instances come last.
    fn fastest_index(&self, candidates: &[ServiceInstance]) -> usize {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, i)| self.response_time(i).unwrap_or(Duration::MAX))
            .map(|(index, _)| index)
            .unwrap_or(0)
    }
}

fn is_positive_weight(weight: f64) -> bool {
    weight.is_finite() && weight > 0.0
}

/// Random index with probability proportional to weight. Non-positive weights
/// never win; `None` when no weight is positive.
fn weighted_index(candidates: &[ServiceInstance]) -> Option<usize> {
    let total: f64 = candidates
        .iter()
        .map(|i| i.weight)
        .filter(|w| is_positive_weight(*w))
        .sum();
    if total <= 0.0 {
        return None;
    }

    let mut remaining = rand::rng().random::<f64>() * total;
    let mut last_positive = None;
    for (index, instance) in candidates.iter().enumerate() {
        if !is_positive_weight(instance.weight) {
            continue;
        }
        last_positive = Some(index);
        if remaining < instance.weight {
            return Some(index);
        }
        remaining -= instance.weight;
    }

    last_positive
}

fn least_connections_index(candidates: &[ServiceInstance], connections: &dyn ConnectionCounter) -> usize {
    candidates
        .iter()
        .enumerate()
        .min_by_key(|(_, i)| connections.active_connections(&i.address()))
        .map(|(index, _)| index)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::NoopAuditSink;
    use crate::cache::InstanceCache;
    use crate::subscriber::RegistrySubscriber;
    use crate::testing::{FakeNaming, FakeProtocol};
    use mcp_router_common::config::HealthConfig;

    fn build_router(
        naming: Arc<FakeNaming>,
        settings: RouterSettings,
        groups: &[&str],
    ) -> (Router, Arc<CircuitBreakerRegistry>) {
        let cache = Arc::new(InstanceCache::new(Duration::from_secs(30)));
        let subscriber = Arc::new(RegistrySubscriber::new(naming.clone(), cache.clone(), 16));
        let discovery = Arc::new(ServiceDiscovery::new(
            naming,
            cache,
            subscriber,
            Duration::from_millis(200),
            groups.iter().map(|g| g.to_string()).collect(),
        ));
        let breakers = Arc::new(CircuitBreakerRegistry::default());
        let router = Router::new(discovery, breakers.clone(), Arc::new(NoopAuditSink), settings);
        (router, breakers)
    }

    fn instances(count: u16) -> Vec<ServiceInstance> {
        (0..count)
            .map(|i| ServiceInstance::new("svc", "grp", format!("10.0.0.{}", i + 1), 8080))
            .collect()
    }

    #[tokio::test]
    async fn test_first_policy_is_stable() {
        let naming = Arc::new(FakeNaming::default());
        naming.set_instances("svc", "grp", instances(3));
        let (router, _) = build_router(naming, RouterSettings::default(), &["grp"]);

        for _ in 0..5 {
            let selected = router.select_instance("svc", "grp").await.unwrap();
            assert_eq!(selected.host, "10.0.0.1");
        }
    }

    #[tokio::test]
    async fn test_round_robin_rotates() {
        let naming = Arc::new(FakeNaming::default());
        naming.set_instances("svc", "grp", instances(3));
        let (router, _) = build_router(naming, RouterSettings::default(), &["grp"]);

        let mut hosts = Vec::new();
        for _ in 0..6 {
            let selected = router
                .select_with_policy("svc", "grp", LoadBalancePolicy::RoundRobin)
                .await
                .unwrap();
            hosts.push(selected.host);
        }
        assert_eq!(hosts[0..3], hosts[3..6]);
        assert_ne!(hosts[0], hosts[1]);
        assert_ne!(hosts[1], hosts[2]);
    }

    #[tokio::test]
    async fn test_open_circuit_yields_no_healthy_instance() {
        let naming = Arc::new(FakeNaming::default());
        naming.set_instances("svc", "grp", instances(2));
        let (router, breakers) = build_router(naming, RouterSettings::default(), &["grp"]);

        breakers.open_circuit("svc");
        let err = router.select_instance("svc", "grp").await.unwrap_err();
        assert!(matches!(err, RouterError::NoHealthyInstance(ref s) if s == "svc"));

        breakers.close_circuit("svc");
        assert!(router.select_instance("svc", "grp").await.is_ok());
    }

    #[tokio::test]
    async fn test_smart_routing_falls_back_to_other_groups() {
        let naming = Arc::new(FakeNaming::default());
        naming.set_instances(
            "svc",
            "tools",
            vec![ServiceInstance::new("svc", "tools", "10.0.1.1", 9000)],
        );

        let (router, _) = build_router(naming.clone(), RouterSettings::default(), &["grp", "tools"]);
        let selected = router.select_instance("svc", "grp").await.unwrap();
        assert_eq!(selected.group, "tools");

        let settings = RouterSettings {
            smart_routing: false,
            ..Default::default()
        };
        let (router, _) = build_router(naming, settings, &["grp", "tools"]);
        assert!(router.select_instance("svc", "grp").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_selection_is_bounded_when_registry_hangs() {
        let naming = Arc::new(FakeNaming::default());
        naming.set_list_delay(Some(Duration::from_secs(30)));
        let (router, _) = build_router(naming, RouterSettings::default(), &["grp", "tools"]);

        let started = Instant::now();
        let result = router.select_instance("svc", "grp").await;
        assert!(matches!(result, Err(RouterError::NoHealthyInstance(_))));
        assert!(started.elapsed() <= Duration::from_millis(250));
    }

    #[test]
    fn test_weighted_random_ignores_non_positive_weights() {
        let candidates = vec![
            ServiceInstance::new("svc", "grp", "a", 1).with_weight(0.0),
            ServiceInstance::new("svc", "grp", "b", 1).with_weight(-2.0),
            ServiceInstance::new("svc", "grp", "c", 1).with_weight(1.0),
        ];
        for _ in 0..100 {
            assert_eq!(weighted_index(&candidates), Some(2));
        }

        let zeros = vec![
            ServiceInstance::new("svc", "grp", "a", 1).with_weight(0.0),
            ServiceInstance::new("svc", "grp", "b", 1).with_weight(0.0),
        ];
        assert_eq!(weighted_index(&zeros), None);
    }

    #[test]
    fn test_weighted_random_distribution() {
        let candidates = vec![
            ServiceInstance::new("svc", "grp", "a", 1).with_weight(1.0),
            ServiceInstance::new("svc", "grp", "b", 1).with_weight(9.0),
        ];
        let mut counts: HashMap<usize, usize> = HashMap::new();
        for _ in 0..10_000 {
            *counts.entry(weighted_index(&candidates).unwrap()).or_default() += 1;
        }
        let heavy = counts.get(&1).copied().unwrap_or(0);
        assert!(heavy > 8_000 && heavy < 9_800, "heavy={}", heavy);
    }

    #[tokio::test]
    async fn test_all_zero_weights_fall_back_to_round_robin() {
        let naming = Arc::new(FakeNaming::default());
        let (router, _) = build_router(naming, RouterSettings::default(), &["grp"]);
        let candidates: Vec<_> = instances(2).into_iter().map(|i| i.with_weight(0.0)).collect();
        let key = ServiceKey::new("svc", "grp");

        let a = router.pick(&key, &candidates, LoadBalancePolicy::WeightedRandom).unwrap();
        let b = router.pick(&key, &candidates, LoadBalancePolicy::WeightedRandom).unwrap();
        assert_ne!(a.host, b.host);
    }

    #[tokio::test]
    async fn test_least_connections() {
        let naming = Arc::new(FakeNaming::default());
        let tracker = Arc::new(ConnectionTracker::new());
        let (router, _) = build_router(naming, RouterSettings::default(), &["grp"]);
        let router = router.with_connection_counter(tracker.clone());
        let candidates = instances(3);

        tracker.acquire("10.0.0.1:8080");
        tracker.acquire("10.0.0.1:8080");
        tracker.acquire("10.0.0.2:8080");
        tracker.acquire("10.0.0.3:8080");
        tracker.release("10.0.0.3:8080");

        let key = ServiceKey::new("svc", "grp");
        let selected = router
            .pick(&key, &candidates, LoadBalancePolicy::LeastConnections)
            .unwrap();
        assert_eq!(selected.host, "10.0.0.3");
    }

    #[test]
    fn test_connection_tracker_never_underflows() {
        let tracker = ConnectionTracker::new();
        tracker.release("unknown:1");
        assert_eq!(tracker.acquire("h:1"), 1);
        tracker.release("h:1");
        tracker.release("h:1");
        assert_eq!(tracker.active_connections("h:1"), 0);
    }

    fn health_monitor(protocol: Arc<FakeProtocol>, breakers: Arc<CircuitBreakerRegistry>) -> Arc<HealthMonitor> {
        Arc::new(HealthMonitor::new(
            HealthConfig::default(),
            protocol,
            breakers,
            Arc::new(InstanceCache::new(Duration::from_secs(30))),
            Arc::new(NoopAuditSink),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_instances_marked_unhealthy_are_skipped() {
        let naming = Arc::new(FakeNaming::default());
        naming.set_instances("svc", "grp", instances(2));
        let (router, breakers) = build_router(naming, RouterSettings::default(), &["grp"]);
        let protocol = Arc::new(FakeProtocol::default());
        protocol.set_reachable("10.0.0.1:8080", false);
        let health = health_monitor(protocol, breakers.clone());
        let router = router.with_health_monitor(health.clone());

        let all = instances(2);
        // interleaved so the service breaker stays closed
        for _ in 0..3 {
            health.probe(&all[0]).await;
            health.probe(&all[1]).await;
        }
        assert!(health.is_unhealthy(&all[0].key()));
        assert!(!breakers.is_open("svc"));

        for policy in [LoadBalancePolicy::First, LoadBalancePolicy::RoundRobin] {
            for _ in 0..5 {
                let selected = router.select_with_policy("svc", "grp", policy).await.unwrap();
                assert_eq!(selected.host, "10.0.0.2");
            }
        }
    }

    #[tokio::test]
    async fn test_smooth_weighted_round_robin_sequence() {
        let naming = Arc::new(FakeNaming::default());
        let (router, _) = build_router(naming, RouterSettings::default(), &["grp"]);
        let candidates = vec![
            ServiceInstance::new("svc", "grp", "a", 1).with_weight(5.0),
            ServiceInstance::new("svc", "grp", "b", 1).with_weight(1.0),
            ServiceInstance::new("svc", "grp", "c", 1).with_weight(1.0),
        ];
        let key = ServiceKey::new("svc", "grp");

        let hosts: Vec<String> = (0..14)
            .map(|_| {
                router
                    .pick(&key, &candidates, LoadBalancePolicy::WeightedRoundRobin)
                    .unwrap()
                    .host
            })
            .collect();
        let round = ["a", "a", "b", "a", "c", "a", "a"];
        assert_eq!(hosts[..7], round);
        assert_eq!(hosts[7..], round);
    }

    #[tokio::test]
    async fn test_weighted_round_robin_skips_zero_weights_and_forgets_removed() {
        let naming = Arc::new(FakeNaming::default());
        let (router, _) = build_router(naming, RouterSettings::default(), &["grp"]);
        let key = ServiceKey::new("svc", "grp");
        let candidates = vec![
            ServiceInstance::new("svc", "grp", "a", 1).with_weight(0.0),
            ServiceInstance::new("svc", "grp", "b", 1).with_weight(2.0),
        ];
        for _ in 0..4 {
            let selected = router
                .pick(&key, &candidates, LoadBalancePolicy::WeightedRoundRobin)
                .unwrap();
            assert_eq!(selected.host, "b");
        }

        let remaining = vec![ServiceInstance::new("svc", "grp", "c", 1).with_weight(1.0)];
        router.pick(&key, &remaining, LoadBalancePolicy::WeightedRoundRobin);
        let weights = router.smooth_weights.get(&key).unwrap();
        assert_eq!(weights.len(), 1);
        assert!(weights.contains_key("c:1"));
    }

    #[tokio::test]
    async fn test_fastest_response_prefers_lowest_reported_time() {
        let naming = Arc::new(FakeNaming::default());
        let (router, _) = build_router(naming, RouterSettings::default(), &["grp"]);
        let key = ServiceKey::new("svc", "grp");
        let candidates = instances(3);

        let first = router.pick(&key, &candidates, LoadBalancePolicy::FastestResponse).unwrap();
        assert_eq!(first.host, "10.0.0.1");

        router.record_response("10.0.0.1:8080", Duration::from_millis(50), true);
        router.record_response("10.0.0.2:8080", Duration::from_millis(10), true);
        let selected = router.pick(&key, &candidates, LoadBalancePolicy::FastestResponse).unwrap();
        assert_eq!(selected.host, "10.0.0.2");

        for _ in 0..5 {
            router.record_response("10.0.0.2:8080", Duration::from_millis(200), false);
        }
        let selected = router.pick(&key, &candidates, LoadBalancePolicy::FastestResponse).unwrap();
        assert_eq!(selected.host, "10.0.0.1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fastest_response_falls_back_to_probe_latency() {
        let naming = Arc::new(FakeNaming::default());
        naming.set_instances("svc", "grp", instances(2));
        let (router, breakers) = build_router(naming, RouterSettings::default(), &["grp"]);
        let protocol = Arc::new(FakeProtocol::default());
        let health = health_monitor(protocol.clone(), breakers);
        let router = router.with_health_monitor(health.clone());
        let all = instances(2);

        protocol.set_connect_delay(Some(Duration::from_millis(40)));
        health.probe(&all[0]).await;
        protocol.set_connect_delay(Some(Duration::from_millis(5)));
        health.probe(&all[1]).await;

        let selected = router
            .select_with_policy("svc", "grp", LoadBalancePolicy::FastestResponse)
            .await
            .unwrap();
        assert_eq!(selected.host, "10.0.0.2");
    }

    #[tokio::test]
    async fn test_stats_count_selections_and_outcomes() {
        let naming = Arc::new(FakeNaming::default());
        naming.set_instances("svc", "grp", instances(2));
        let tracker = Arc::new(ConnectionTracker::new());
        let (router, _) = build_router(naming, RouterSettings::default(), &["grp"]);
        let router = router.with_connection_counter(tracker.clone());

        for _ in 0..4 {
            router
                .select_with_policy("svc", "grp", LoadBalancePolicy::RoundRobin)
                .await
                .unwrap();
        }
        tracker.acquire("10.0.0.1:8080");
        router.record_response("10.0.0.1:8080", Duration::from_millis(20), true);
        router.record_response("10.0.0.1:8080", Duration::from_millis(20), false);

        let stats = router.stats();
        assert_eq!(stats.policy, LoadBalancePolicy::First);
        assert_eq!(stats.total_selections, 4);
        assert_eq!(stats.instances.len(), 2);

        let first = &stats.instances[0];
        assert_eq!(first.address, "10.0.0.1:8080");
        assert_eq!(first.selections, 2);
        assert_eq!(first.successes, 1);
        assert_eq!(first.errors, 1);
        assert_eq!(first.active_connections, 1);
        assert!(matches!(first.response_time_ms, Some(19..=20)));
        assert_eq!(stats.instances[1].response_time_ms, None);
    }

    #[tokio::test]
    async fn test_pick_on_empty_candidates() {
        let naming = Arc::new(FakeNaming::default());
        let (router, _) = build_router(naming, RouterSettings::default(), &["grp"]);
        let key = ServiceKey::new("svc", "grp");
        assert!(router.pick(&key, &[], LoadBalancePolicy::Random).is_none());
    }
}
