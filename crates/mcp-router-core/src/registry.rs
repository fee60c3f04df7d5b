//! The `McpRegistry` facade
//!
//! Owns every component and the background tasks that drive them. Callers
//! construct one per process and share it behind an `Arc`.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mcp_router_api::{ConfigClient, McpServerInfo, NamingClient, ProtocolClient, ServiceInstance};
use mcp_router_common::{Result, RouterConfig, ShutdownSignal};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audit::{
    AuditSink, AuditWriter, ChannelAuditSink, JsonLinesAuditWriter, NoopAuditSink,
    TracingAuditWriter,
};
use crate::cache::InstanceCache;
use crate::circuit_breaker::{CircuitBreakerRegistry, CircuitBreakerState};
use crate::discovery::ServiceDiscovery;
use crate::health::{HealthMonitor, HealthRecord};
use crate::registrar::Registrar;
use crate::router::{ConnectionTracker, LoadBalancerStats, Router};
use crate::subscriber::RegistrySubscriber;

/// Registry, health and routing state of one router process
pub struct McpRegistry {
    config: RouterConfig,
    shutdown: ShutdownSignal,
    cache: Arc<InstanceCache>,
    subscriber: Arc<RegistrySubscriber>,
    discovery: Arc<ServiceDiscovery>,
    breakers: Arc<CircuitBreakerRegistry>,
    health: Arc<HealthMonitor>,
    registrar: Arc<Registrar>,
    router: Arc<Router>,
    connections: Arc<ConnectionTracker>,
    audit_channel: Option<Arc<ChannelAuditSink>>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl McpRegistry {
    pub fn new(
        config: RouterConfig,
        naming: Arc<dyn NamingClient>,
        config_client: Arc<dyn ConfigClient>,
        protocol: Arc<dyn ProtocolClient>,
    ) -> Self {
        let shutdown = ShutdownSignal::new();

        let audit_channel = config
            .audit
            .enabled
            .then(|| Arc::new(ChannelAuditSink::new(config.audit.buffer)));
        let audit: Arc<dyn AuditSink> = match &audit_channel {
            Some(channel) => channel.clone(),
            None => Arc::new(NoopAuditSink),
        };

        let cache = Arc::new(InstanceCache::new(config.cache.ttl()));
        let subscriber = Arc::new(RegistrySubscriber::new(
            naming.clone(),
            cache.clone(),
            config.cache.event_buffer,
        ));
        let discovery = Arc::new(ServiceDiscovery::new(
            naming.clone(),
            cache.clone(),
            subscriber.clone(),
            config.cache.query_timeout(),
            config.registry.service_groups.clone(),
        )
        .with_retry_after(config.cache.retry_after()));
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
        let health = Arc::new(HealthMonitor::new(
            config.health.clone(),
            protocol,
            breakers.clone(),
            cache.clone(),
            audit.clone(),
        ));
        let registrar = Arc::new(Registrar::new(
            naming,
            config_client,
            cache.clone(),
            subscriber.clone(),
            audit.clone(),
            config.retry.clone(),
            config.registry.remote_timeout(),
            shutdown.clone(),
        ));
        let connections = Arc::new(ConnectionTracker::new());
        let router = Arc::new(
            Router::new(
                discovery.clone(),
                breakers.clone(),
                audit,
                config.router.clone(),
            )
            .with_connection_counter(connections.clone())
            .with_health_monitor(health.clone()),
        );

        Self {
            config,
            shutdown,
            cache,
            subscriber,
            discovery,
            breakers,
            health,
            registrar,
            router,
            connections,
            audit_channel,
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the background tasks. Later calls are no-ops.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut tasks = Vec::with_capacity(5);

        tasks.push(tokio::spawn(
            self.subscriber.clone().run(self.shutdown.clone()),
        ));

        if self.config.health.enabled {
            tasks.push(tokio::spawn(self.health.clone().run(self.shutdown.clone())));
        } else {
            info!("Periodic health checks are disabled");
        }

        tasks.push(tokio::spawn(
            self.registrar
                .clone()
                .run_heartbeats(self.config.registry.heartbeat_interval()),
        ));

        tasks.push(tokio::spawn(run_maintenance(
            self.cache.clone(),
            self.breakers.clone(),
            self.health.clone(),
            self.config.circuit_breaker.idle_grace(),
            self.shutdown.clone(),
        )));

        if let Some(channel) = &self.audit_channel {
            let writer: Box<dyn AuditWriter> = match &self.config.audit.path {
                Some(path) => Box::new(JsonLinesAuditWriter::new(path)),
                None => Box::new(TracingAuditWriter),
            };
            tasks.push(tokio::spawn(channel.clone().run(
                writer,
                self.config.audit.batch_size,
                self.config.audit.flush_interval(),
                self.shutdown.clone(),
            )));
        }

        info!("MCP registry started with {} background tasks", tasks.len());
        self.tasks.lock().extend(tasks);
    }

    /// Stop the background tasks, optionally deregistering everything this
    /// process registered first.
    pub async fn shutdown(&self, deregister: bool) {
        info!("Shutting down MCP registry");
        // cancels in-flight registration backoffs
        self.shutdown.shutdown();

        if deregister {
            self.registrar.deregister_all().await;
        }
        self.subscriber.unsubscribe_all().await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        info!("MCP registry stopped");
    }

    pub async fn register_server(&self, info: &McpServerInfo) -> Result<ServiceInstance> {
        let mut info = info.clone();
        if info.group.is_empty() {
            info.group = self.config.registry.default_group.clone();
        }
        if info.namespace.is_empty() {
            info.namespace = self.config.registry.namespace.clone();
        }
        self.registrar.register(&info).await
    }

    pub async fn deregister_server(&self, service_name: &str, group: &str) -> Result<()> {
        self.registrar.deregister(service_name, group).await
    }

    pub async fn get_healthy_servers(&self, service_name: &str, group: &str) -> Vec<ServiceInstance> {
        self.discovery
            .get_healthy_instances(service_name, group)
            .await
    }

    pub async fn select_instance(&self, service_name: &str, group: &str) -> Result<ServiceInstance> {
        self.router.select_instance(service_name, group).await
    }

    /// Report the outcome of a call routed to `address`; feeds fastest-response routing.
    pub fn record_response(&self, address: &str, elapsed: Duration, success: bool) {
        self.router.record_response(address, elapsed, success);
    }

    pub fn load_balancer_stats(&self) -> LoadBalancerStats {
        self.router.stats()
    }

    pub fn get_health_status(&self, service_name: &str) -> Option<HealthRecord> {
        self.health.service_health(service_name)
    }

    pub fn get_circuit_breaker_state(&self, service_name: &str) -> Option<CircuitBreakerState> {
        self.breakers.state(service_name)
    }

    pub fn reset_circuit_breaker(&self, service_name: &str) {
        self.breakers.reset_circuit_breaker(service_name);
    }

    pub fn open_circuit(&self, service_name: &str) {
        self.breakers.open_circuit(service_name);
    }

    pub fn close_circuit(&self, service_name: &str) {
        self.breakers.close_circuit(service_name);
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn registrar(&self) -> &Arc<Registrar> {
        &self.registrar
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn discovery(&self) -> &Arc<ServiceDiscovery> {
        &self.discovery
    }

    pub fn connections(&self) -> &Arc<ConnectionTracker> {
        &self.connections
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Audit events dropped because the writer fell behind
    pub fn audit_dropped(&self) -> u64 {
        self.audit_channel.as_ref().map_or(0, |c| c.dropped())
    }
}

/// Drop breakers and health records of services that left the registry.
async fn run_maintenance(
    cache: Arc<InstanceCache>,
    breakers: Arc<CircuitBreakerRegistry>,
    health: Arc<HealthMonitor>,
    idle_grace: Duration,
    shutdown: ShutdownSignal,
) {
    let period = (idle_grace / 2).max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let active: HashSet<String> = cache.service_names().into_iter().collect();
                let breakers_removed = breakers.sweep(&active);
                let records_removed = health.evict_absent(idle_grace);
                debug!(
                    "Maintenance sweep: breakers_removed={}, records_removed={}",
                    breakers_removed, records_removed
                );
            }
            _ = shutdown.cancelled() => break,
        }
    }
}
