//! Active protocol-level health monitoring
//!
//! Each probe opens a protocol session to the instance and pings it within
//! the probe timeout. Consecutive outcomes drive a per-instance `HealthRecord`
//! with hysteresis, and every admitted outcome is forwarded to the service's
//! circuit breaker.

use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use mcp_router_api::{InstanceKey, ProtocolClient, ServiceInstance, ServiceKey};
use mcp_router_common::config::HealthConfig;
use mcp_router_common::{RouterError, ShutdownSignal};
use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior, timeout};
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditSink, now_millis};
use crate::cache::InstanceCache;
use crate::circuit_breaker::CircuitBreakerRegistry;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

impl Display for HealthStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => f.write_str("HEALTHY"),
            HealthStatus::Unhealthy => f.write_str("UNHEALTHY"),
        }
    }
}

/// Health state of one instance
#[derive(Clone, Debug)]
pub struct HealthRecord {
    pub service_name: String,
    pub group: String,
    pub host: String,
    pub port: u16,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub total_checks: u64,
    pub last_status: HealthStatus,
    pub last_checked_at: Option<Instant>,
    pub last_response_time: Option<Duration>,
    pub last_error: Option<String>,
    absent_since: Option<Instant>,
}

impl HealthRecord {
    pub fn new(instance: &ServiceInstance) -> Self {
        Self {
            service_name: instance.service_name.clone(),
            group: instance.group.clone(),
            host: instance.host.clone(),
            port: instance.port,
            consecutive_successes: 0,
            consecutive_failures: 0,
            total_checks: 0,
            last_status: HealthStatus::Healthy,
            last_checked_at: None,
            last_response_time: None,
            last_error: None,
            absent_since: None,
        }
    }

    pub fn key(&self) -> InstanceKey {
        InstanceKey {
            service_name: self.service_name.clone(),
            group: self.group.clone(),
            host: self.host.clone(),
            port: self.port,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.last_status == HealthStatus::Healthy
    }

    /// Apply one probe outcome. Returns the new status when it flipped.
    pub fn apply_outcome(
        &mut self,
        success: bool,
        failure_threshold: u32,
        success_threshold: u32,
    ) -> Option<HealthStatus> {
        self.total_checks += 1;

        if success {
            self.consecutive_successes = self.consecutive_successes.saturating_add(1);
            self.consecutive_failures = 0;
            if self.last_status == HealthStatus::Unhealthy
                && self.consecutive_successes >= success_threshold
            {
                self.last_status = HealthStatus::Healthy;
                return Some(HealthStatus::Healthy);
            }
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.consecutive_successes = 0;
            if self.last_status == HealthStatus::Healthy
                && self.consecutive_failures >= failure_threshold
            {
                self.last_status = HealthStatus::Unhealthy;
                return Some(HealthStatus::Unhealthy);
            }
        }

        None
    }
}

/// Aggregate counts over every health record
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HealthStats {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub health_rate: f64,
}

pub struct HealthMonitor {
    config: HealthConfig,
    protocol: Arc<dyn ProtocolClient>,
    breakers: Arc<CircuitBreakerRegistry>,
    cache: Arc<InstanceCache>,
    audit: Arc<dyn AuditSink>,
    records: DashMap<InstanceKey, HealthRecord>,
    running: AtomicBool,
}

impl HealthMonitor {
    pub fn new(
        config: HealthConfig,
        protocol: Arc<dyn ProtocolClient>,
        breakers: Arc<CircuitBreakerRegistry>,
        cache: Arc<InstanceCache>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            config,
            protocol,
            breakers,
            cache,
            audit,
            records: DashMap::new(),
            running: AtomicBool::new(false),
        }
    }

    /// Probe one instance and return its updated record. Never fails.
    ///
    /// When the service's breaker refuses the probe, the record is returned unchanged.
    pub async fn probe(&self, instance: &ServiceInstance) -> HealthRecord {
        let key = instance.key();

        // released on drop if this future is cancelled mid-probe
        let permit = match self.breakers.try_probe(&instance.service_name) {
            Some(permit) => permit,
            None => {
                return self
                    .records
                    .get(&key)
                    .map(|r| r.clone())
                    .unwrap_or_else(|| HealthRecord::new(instance));
            }
        };

        let started = Instant::now();
        let outcome = self.check(instance).await;
        let elapsed = started.elapsed();
        let success = outcome.is_ok();

        let (record, transition) = {
            let mut record = self
                .records
                .entry(key.clone())
                .or_insert_with(|| HealthRecord::new(instance));
            let transition = record.apply_outcome(
                success,
                self.config.failure_threshold,
                self.config.success_threshold,
            );
            record.last_checked_at = Some(Instant::now());
            record.last_response_time = Some(elapsed);
            record.last_error = outcome.as_ref().err().map(|e| e.to_string());
            (record.clone(), transition)
        };

        if success {
            permit.success();
        } else {
            permit.failure();
        }

        match (transition, &outcome) {
            (Some(HealthStatus::Unhealthy), Err(e)) => {
                warn!(
                    "Instance marked unhealthy after {} consecutive failures: {}, {}",
                    record.consecutive_failures, key, e
                );
            }
            (Some(HealthStatus::Healthy), _) => {
                info!(
                    "Instance recovered after {} consecutive successes: {}",
                    record.consecutive_successes, key
                );
            }
            (_, Err(e)) => debug!("Health probe failed: {}, {}", key, e),
            _ => debug!("Health probe succeeded: {} in {:?}", key, elapsed),
        }

        metrics::counter!(
            "mcp_router_probe_total",
            "result" => if success { "success" } else { "failure" }
        )
        .increment(1);

        self.audit.emit(AuditEvent::HealthCheck {
            service: record.service_name.clone(),
            group: record.group.clone(),
            host: record.host.clone(),
            port: record.port,
            success,
            status: record.last_status.to_string(),
            consecutive_successes: record.consecutive_successes,
            consecutive_failures: record.consecutive_failures,
            total_checks: record.total_checks,
            response_time_ms: elapsed.as_millis() as u64,
            message: record.last_error.clone(),
            timestamp: now_millis(),
        });

        record
    }

    async fn check(&self, instance: &ServiceInstance) -> Result<(), RouterError> {
        let probe_timeout = self.config.probe_timeout();
        let attempt = async {
            let mut session = self.protocol.connect(instance).await?;
            let result = session.ping().await;
            session.close().await;
            result
        };

        match timeout(probe_timeout, attempt).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(RouterError::ProbeFailed {
                instance: instance.address(),
                reason: e.to_string(),
            }),
            Err(_) => Err(RouterError::ProbeFailed {
                instance: instance.address(),
                reason: format!("{} probe timed out after {:?}", self.protocol.name(), probe_timeout),
            }),
        }
    }

    /// Probe the given instances with at most `max_concurrent_probes` in flight.
    pub async fn probe_instances(&self, instances: Vec<ServiceInstance>) -> Vec<HealthRecord> {
        let limit = self.config.max_concurrent_probes.max(1);
        futures::stream::iter(instances)
            .map(|instance| async move { self.probe(&instance).await })
            .buffer_unordered(limit)
            .collect()
            .await
    }

    /// Probe every cached instance.
    pub async fn probe_all(&self) -> Vec<HealthRecord> {
        let instances = self.cache.all_instances();
        debug!("Probing {} cached instances", instances.len());
        self.probe_instances(instances).await
    }

    /// Probe the cached instances of one service.
    pub async fn probe_service(&self, service_name: &str, group: &str) -> Vec<HealthRecord> {
        let instances = self
            .cache
            .get_any(&ServiceKey::new(service_name, group))
            .unwrap_or_default();
        self.probe_instances(instances).await
    }

    pub fn get_health(&self, key: &InstanceKey) -> Option<HealthRecord> {
        self.records.get(key).map(|r| r.clone())
    }

    /// Whether probing has marked the instance unhealthy. Unprobed instances are not.
    pub fn is_unhealthy(&self, key: &InstanceKey) -> bool {
        self.records.get(key).is_some_and(|r| !r.is_healthy())
    }

    /// Duration of the instance's last probe.
    pub fn response_time(&self, key: &InstanceKey) -> Option<Duration> {
        self.records.get(key).and_then(|r| r.last_response_time)
    }

    /// The most recently checked record among the service's instances.
    pub fn service_health(&self, service_name: &str) -> Option<HealthRecord> {
        self.records
            .iter()
            .filter(|r| r.service_name == service_name)
            .max_by_key(|r| r.last_checked_at)
            .map(|r| r.value().clone())
    }

    pub fn records(&self) -> Vec<HealthRecord> {
        self.records.iter().map(|r| r.value().clone()).collect()
    }

    pub fn health_stats(&self) -> HealthStats {
        let total = self.records.len();
        let healthy = self.records.iter().filter(|r| r.is_healthy()).count();
        let unhealthy = total - healthy;
        let health_rate = if total == 0 {
            1.0
        } else {
            healthy as f64 / total as f64
        };

        HealthStats {
            total,
            healthy,
            unhealthy,
            health_rate,
        }
    }

    /// Drop records of instances missing from every cache view for longer than `grace`.
    pub fn evict_absent(&self, grace: Duration) -> usize {
        let present: HashSet<InstanceKey> = self
            .cache
            .all_instances()
            .iter()
            .map(ServiceInstance::key)
            .collect();
        let before = self.records.len();

        self.records.retain(|key, record| {
            if present.contains(key) {
                record.absent_since = None;
                return true;
            }
            let absent_since = *record.absent_since.get_or_insert_with(Instant::now);
            absent_since.elapsed() < grace
        });

        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            info!("Evicted {} health records of vanished instances", removed);
        }
        removed
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Periodic probing loop; returns on shutdown.
    pub async fn run(self: Arc<Self>, shutdown: ShutdownSignal) {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        info!("Starting health monitor: interval={:?}", self.config.interval());
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let records = self.probe_all().await;
                    let stats = self.health_stats();
                    debug!(
                        "Health round finished: probed={}, healthy={}, unhealthy={}",
                        records.len(), stats.healthy, stats.unhealthy
                    );
                }
                _ = shutdown.cancelled() => break,
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("Stopped health monitor");
    }
}
