//! Registration of backend servers
//!
//! A registration publishes the server, tool and version descriptors in that
//! order and then registers the instance with the naming registry. Any failure
//! deletes the descriptors already published before the attempt is retried.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use mcp_router_api::descriptor::{
    ArtifactKind, McpServerDescriptor, McpToolsDescriptor, McpVersionDescriptor,
};
use mcp_router_api::{
    ConfigClient, DEFAULT_VERSION, InstanceKey, METADATA_SERVER_MD5, McpServerInfo, NamingClient,
    ServiceInstance, ServiceKey,
};
use mcp_router_common::config::RetryConfig;
use mcp_router_common::fingerprint::{md5_hex, name_based_uuid};
use mcp_router_common::{Result, RouterError, ShutdownSignal};
use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditEvent, AuditSink, RegistrationAction, now_millis};
use crate::cache::InstanceCache;
use crate::subscriber::RegistrySubscriber;

/// A registration owned by this process
#[derive(Clone, Debug)]
pub struct Registration {
    pub instance: ServiceInstance,
    pub descriptor_id: String,
    pub version: String,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

/// Descriptors of one `register()` attempt and which of them were published
struct RegistrationTransaction {
    id: String,
    version: String,
    artifacts: Vec<(ArtifactKind, String)>,
    published: Vec<ArtifactKind>,
    server_md5: String,
}

impl RegistrationTransaction {
    fn prepare(info: &McpServerInfo) -> Result<Self> {
        let id = descriptor_id(info);
        // one release date per transaction keeps the fingerprint stable
        let release_date = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

        let server = to_json(&McpServerDescriptor::new(info, &id, &release_date))?;
        let tools = to_json(&McpToolsDescriptor::new(info))?;
        let version = to_json(&McpVersionDescriptor::new(info, &id, &release_date))?;
        let server_md5 = md5_hex(&server);

        Ok(Self {
            id,
            version: info.version.clone(),
            artifacts: vec![
                (ArtifactKind::Server, server),
                (ArtifactKind::Tools, tools),
                (ArtifactKind::Version, version),
            ],
            published: Vec::with_capacity(3),
            server_md5,
        })
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| RouterError::Other(e.into()))
}

fn descriptor_id(info: &McpServerInfo) -> String {
    info.id
        .clone()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| name_based_uuid(&info.name))
}

/// Reject registrations missing identity fields.
pub fn validate(info: &McpServerInfo) -> Result<()> {
    if info.name.trim().is_empty() {
        return Err(RouterError::InvalidInstance("service name is empty".into()));
    }
    if info.group.trim().is_empty() {
        return Err(RouterError::InvalidInstance(format!(
            "group of {} is empty",
            info.name
        )));
    }
    if info.host.trim().is_empty() {
        return Err(RouterError::InvalidInstance(format!(
            "host of {} is empty",
            info.name
        )));
    }
    if info.port == 0 {
        return Err(RouterError::InvalidInstance(format!(
            "port of {} must be in 1..=65535",
            info.name
        )));
    }
    if info.version.trim().is_empty() {
        return Err(RouterError::InvalidInstance(format!(
            "version of {} is empty",
            info.name
        )));
    }
    Ok(())
}

pub struct Registrar {
    naming: Arc<dyn NamingClient>,
    config: Arc<dyn ConfigClient>,
    cache: Arc<InstanceCache>,
    subscriber: Arc<RegistrySubscriber>,
    audit: Arc<dyn AuditSink>,
    retry: RetryConfig,
    remote_timeout: Duration,
    shutdown: ShutdownSignal,
    registered: DashMap<InstanceKey, Registration>,
}

impl Registrar {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        naming: Arc<dyn NamingClient>,
        config: Arc<dyn ConfigClient>,
        cache: Arc<InstanceCache>,
        subscriber: Arc<RegistrySubscriber>,
        audit: Arc<dyn AuditSink>,
        retry: RetryConfig,
        remote_timeout: Duration,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            naming,
            config,
            cache,
            subscriber,
            audit,
            retry,
            remote_timeout,
            shutdown,
            registered: DashMap::new(),
        }
    }

    /// Register a backend server, retrying the whole sequence with backoff.
    pub async fn register(&self, info: &McpServerInfo) -> Result<ServiceInstance> {
        validate(info)?;

        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            if self.shutdown.is_shutdown() {
                return Err(RouterError::Cancelled);
            }

            match self.try_register(info).await {
                Ok((instance, tx)) => {
                    self.on_registered(info, instance.clone(), tx).await;
                    return Ok(instance);
                }
                Err(e) => {
                    warn!(
                        "Registration attempt {}/{} failed for {}: {}",
                        attempt, max_attempts, info.name, e
                    );
                    last_error = Some(e);
                }
            }

            if attempt < max_attempts {
                let backoff = self.retry.backoff(attempt);
                debug!("Retrying registration of {} in {:?}", info.name, backoff);
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = self.shutdown.cancelled() => {
                        info!("Registration of {} cancelled by shutdown", info.name);
                        return Err(RouterError::Cancelled);
                    }
                }
            }
        }

        let reason = match last_error {
            Some(e) => format!("{} attempts exhausted, last error: {}", max_attempts, e),
            None => format!("{} attempts exhausted", max_attempts),
        };
        error!("Failed to register {}: {}", info.name, reason);
        metrics::counter!("mcp_router_registration_total", "result" => "failure").increment(1);
        self.audit_registration(info, RegistrationAction::Register, false, Some(reason.clone()));

        Err(RouterError::RegistrationFailed {
            service: info.name.clone(),
            reason,
        })
    }

    async fn try_register(
        &self,
        info: &McpServerInfo,
    ) -> Result<(ServiceInstance, RegistrationTransaction)> {
        let mut tx = RegistrationTransaction::prepare(info)?;

        for index in 0..tx.artifacts.len() {
            let (kind, content) = &tx.artifacts[index];
            let kind = *kind;
            let data_id = kind.data_id(&tx.id, &tx.version);

            let published = match timeout(
                self.remote_timeout,
                self.config.publish(&data_id, kind.group(), content),
            )
            .await
            {
                Ok(Ok(true)) => Ok(()),
                Ok(Ok(false)) => Err(RouterError::RegistryUnavailable(format!(
                    "config store refused {} descriptor {}",
                    kind, data_id
                ))),
                Ok(Err(e)) => Err(RouterError::from(e)),
                Err(_) => Err(RouterError::Timeout(self.remote_timeout)),
            };

            if let Err(e) = published {
                warn!("Failed to publish {} descriptor {}: {}", kind, data_id, e);
                self.rollback(&tx).await;
                return Err(e);
            }
            debug!("Published {} descriptor {}", kind, data_id);
            tx.published.push(kind);
        }

        let mut instance = info.to_instance();
        instance
            .metadata
            .insert(METADATA_SERVER_MD5.to_string(), tx.server_md5.clone());
        instance.touch();

        let registered = match timeout(
            self.remote_timeout,
            self.naming.register(&info.name, &info.group, &instance),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(RouterError::from(e)),
            Err(_) => Err(RouterError::Timeout(self.remote_timeout)),
        };

        if let Err(e) = registered {
            self.rollback(&tx).await;
            return Err(e);
        }

        Ok((instance, tx))
    }

    /// Best-effort delete of the descriptors published by `tx`, newest first.
    async fn rollback(&self, tx: &RegistrationTransaction) {
        for kind in tx.published.iter().rev() {
            let data_id = kind.data_id(&tx.id, &tx.version);
            match timeout(self.remote_timeout, self.config.delete(&data_id, kind.group())).await {
                Ok(Ok(_)) => debug!("Rolled back {} descriptor {}", kind, data_id),
                Ok(Err(e)) => debug!("Rollback of {} descriptor {} failed (ignored): {}", kind, data_id, e),
                Err(_) => debug!("Rollback of {} descriptor {} timed out (ignored)", kind, data_id),
            }
        }
    }

    async fn on_registered(
        &self,
        info: &McpServerInfo,
        instance: ServiceInstance,
        tx: RegistrationTransaction,
    ) {
        let now = Utc::now();
        let key = instance.key();
        info!(
            "Registered instance: service={}, group={}, address={}, md5={}",
            info.name,
            info.group,
            instance.address(),
            tx.server_md5
        );

        self.registered.insert(
            key,
            Registration {
                instance,
                descriptor_id: tx.id,
                version: tx.version,
                registered_at: now,
                last_heartbeat: now,
            },
        );

        let service_key = info.service_key();
        // the next lookup must see the new instance
        self.cache.remove(&service_key);
        if let Err(e) = self.subscriber.ensure_subscribed(&service_key).await {
            warn!("Registered {} but could not watch it: {}", service_key, e);
        }

        metrics::counter!("mcp_router_registration_total", "result" => "success").increment(1);
        self.audit_registration(info, RegistrationAction::Register, true, None);
    }

    /// Remove the descriptors and every instance of `(service_name, group)` owned
    /// by this process. Local bookkeeping is cleared even when the registry fails.
    pub async fn deregister(&self, service_name: &str, group: &str) -> Result<()> {
        let owned: Vec<Registration> = {
            let keys: Vec<InstanceKey> = self
                .registered
                .iter()
                .filter(|e| e.key().service_name == service_name && e.key().group == group)
                .map(|e| e.key().clone())
                .collect();
            keys.iter()
                .filter_map(|k| self.registered.remove(k).map(|(_, r)| r))
                .collect()
        };

        let mut descriptors: Vec<(String, String)> = owned
            .iter()
            .map(|r| (r.descriptor_id.clone(), r.version.clone()))
            .collect();
        descriptors.sort();
        descriptors.dedup();
        if descriptors.is_empty() {
            descriptors.push((name_based_uuid(service_name), DEFAULT_VERSION.to_string()));
        }

        for (id, version) in &descriptors {
            for kind in ArtifactKind::ORDERED {
                let data_id = kind.data_id(id, version);
                match timeout(self.remote_timeout, self.config.delete(&data_id, kind.group())).await {
                    Ok(Ok(_)) => debug!("Deleted {} descriptor {}", kind, data_id),
                    Ok(Err(e)) => warn!("Failed to delete {} descriptor {} (ignored): {}", kind, data_id, e),
                    Err(_) => warn!("Deleting {} descriptor {} timed out (ignored)", kind, data_id),
                }
            }
        }

        self.cache.remove(&ServiceKey::new(service_name, group));

        if owned.is_empty() {
            warn!(
                "Service {}@@{} is not registered by this process, only descriptors were removed",
                group, service_name
            );
            return Ok(());
        }

        let mut failures = Vec::new();
        for registration in &owned {
            let instance = &registration.instance;
            let result = match timeout(
                self.remote_timeout,
                self.naming
                    .deregister(service_name, group, &instance.host, instance.port),
            )
            .await
            {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("timed out after {:?}", self.remote_timeout)),
            };

            let info = McpServerInfo::new(service_name, instance.host.clone(), instance.port)
                .with_group(group);
            match result {
                Ok(()) => {
                    info!(
                        "Deregistered instance: service={}, group={}, address={}",
                        service_name,
                        group,
                        instance.address()
                    );
                    self.audit_registration(&info, RegistrationAction::Deregister, true, None);
                }
                Err(reason) => {
                    warn!(
                        "Failed to deregister {} from registry: {}",
                        instance.address(),
                        reason
                    );
                    self.audit_registration(
                        &info,
                        RegistrationAction::Deregister,
                        false,
                        Some(reason.clone()),
                    );
                    failures.push(format!("{}: {}", instance.address(), reason));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(RouterError::DeregistrationPartial {
                service: service_name.to_string(),
                reason: failures.join("; "),
            })
        }
    }

    /// Deregister everything this process owns; errors are logged.
    pub async fn deregister_all(&self) {
        let mut keys: Vec<ServiceKey> = self
            .registered
            .iter()
            .map(|e| e.key().service_key())
            .collect();
        keys.sort();
        keys.dedup();

        for key in keys {
            if let Err(e) = self.deregister(&key.service_name, &key.group).await {
                warn!("Deregistration of {} during shutdown failed: {}", key, e);
            }
        }
    }

    /// Send a heartbeat for every owned ephemeral instance. Returns how many succeeded.
    pub async fn heartbeat_all(&self) -> usize {
        let instances: Vec<ServiceInstance> = self
            .registered
            .iter()
            .filter(|e| e.instance.ephemeral)
            .map(|e| e.instance.clone())
            .collect();

        let mut succeeded = 0;
        for instance in instances {
            let result = timeout(
                self.remote_timeout,
                self.naming
                    .heartbeat(&instance.service_name, &instance.group, &instance),
            )
            .await;
            match result {
                Ok(Ok(())) => {
                    if let Some(mut registration) = self.registered.get_mut(&instance.key()) {
                        registration.last_heartbeat = Utc::now();
                    }
                    succeeded += 1;
                }
                Ok(Err(e)) => warn!("Heartbeat of {} failed: {}", instance.key(), e),
                Err(_) => warn!("Heartbeat of {} timed out", instance.key()),
            }
        }
        succeeded
    }

    /// Periodic heartbeat loop; returns on shutdown.
    pub async fn run_heartbeats(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let sent = self.heartbeat_all().await;
                    debug!("Sent {} heartbeats", sent);
                }
                _ = self.shutdown.cancelled() => break,
            }
        }
    }

    pub fn registered(&self) -> Vec<Registration> {
        self.registered.iter().map(|e| e.value().clone()).collect()
    }

    pub fn is_registered(&self, key: &InstanceKey) -> bool {
        self.registered.contains_key(key)
    }

    fn audit_registration(
        &self,
        info: &McpServerInfo,
        action: RegistrationAction,
        success: bool,
        message: Option<String>,
    ) {
        self.audit.emit(AuditEvent::Registration {
            service: info.name.clone(),
            group: info.group.clone(),
            host: info.host.clone(),
            port: info.port,
            action,
            success,
            message,
            timestamp: now_millis(),
        });
    }
}
