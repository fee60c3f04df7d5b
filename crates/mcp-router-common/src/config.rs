//! Router configuration
//!
//! Loaded from an optional YAML file and `MCP_ROUTER_` environment variables,
//! with `__` separating nested keys (`MCP_ROUTER_CACHE__TTL_MS=10000`).

use std::fmt::{Display, Formatter};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use config::{Config, Environment, File};
use mcp_router_api::{DEFAULT_GROUP, DEFAULT_NAMESPACE, McpServerInfo};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RouterError};

pub const DEFAULT_CONFIG_FILE: &str = "conf/application.yml";
pub const ENV_PREFIX: &str = "MCP_ROUTER";

/// Instance selection policy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancePolicy {
    /// First instance of the candidate list
    #[default]
    First,
    RoundRobin,
    WeightedRandom,
    Random,
    LeastConnections,
    /// Smooth weighted round robin
    WeightedRoundRobin,
    /// Lowest observed response time
    FastestResponse,
}

impl LoadBalancePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalancePolicy::First => "first",
            LoadBalancePolicy::RoundRobin => "round_robin",
            LoadBalancePolicy::WeightedRandom => "weighted_random",
            LoadBalancePolicy::Random => "random",
            LoadBalancePolicy::LeastConnections => "least_connections",
            LoadBalancePolicy::WeightedRoundRobin => "weighted_round_robin",
            LoadBalancePolicy::FastestResponse => "fastest_response",
        }
    }
}

impl Display for LoadBalancePolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadBalancePolicy {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "first" => Ok(LoadBalancePolicy::First),
            "round_robin" => Ok(LoadBalancePolicy::RoundRobin),
            "weighted_random" | "weighted" => Ok(LoadBalancePolicy::WeightedRandom),
            "random" => Ok(LoadBalancePolicy::Random),
            "least_connections" => Ok(LoadBalancePolicy::LeastConnections),
            "weighted_round_robin" => Ok(LoadBalancePolicy::WeightedRoundRobin),
            "fastest_response" | "fastest" => Ok(LoadBalancePolicy::FastestResponse),
            other => Err(RouterError::Config(format!(
                "unknown load balance policy: {}",
                other
            ))),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_group")]
    pub default_group: String,

    /// Groups scanned by wildcard lookups and smart routing
    #[serde(default = "default_service_groups")]
    pub service_groups: Vec<String>,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default = "default_remote_timeout_ms")]
    pub remote_timeout_ms: u64,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_group: default_group(),
            service_groups: default_service_groups(),
            namespace: default_namespace(),
            remote_timeout_ms: default_remote_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

impl RegistryConfig {
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_ms")]
    pub ttl_ms: u64,

    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    /// Capacity of the watch-event channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Quiet period after a failed registry query, during which the stale view is served
    #[serde(default = "default_retry_after_ms")]
    pub retry_after_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_cache_ttl_ms(),
            query_timeout_ms: default_query_timeout_ms(),
            event_buffer: default_event_buffer(),
            retry_after_ms: default_retry_after_ms(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn retry_after(&self) -> Duration {
        Duration::from_millis(self.retry_after_ms)
    }
}

/// Transport used to probe backend instances
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    /// GET the instance's `sseEndpoint`
    #[default]
    Http,
    /// Plain TCP connect
    Tcp,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub probe: ProbeKind,

    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,

    /// Deadline of one probe, connect and ping together
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    #[serde(default = "default_max_concurrent_probes")]
    pub max_concurrent_probes: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            probe: ProbeKind::default(),
            interval_ms: default_health_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            max_concurrent_probes: default_max_concurrent_probes(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,

    /// Probes admitted while half-open
    #[serde(default = "default_half_open_max_probes")]
    pub half_open_max_probes: u32,

    /// How long a service may have no instances before its breaker is dropped
    #[serde(default = "default_idle_grace_ms")]
    pub idle_grace_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            half_open_max_probes: default_half_open_max_probes(),
            idle_grace_ms: default_idle_grace_ms(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn idle_grace(&self) -> Duration {
        Duration::from_millis(self.idle_grace_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// 1.0 gives a fixed backoff
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            multiplier: default_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `attempt` (1-based), capped at `max_backoff_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.initial_backoff_ms as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RouterSettings {
    #[serde(default)]
    pub policy: LoadBalancePolicy,

    #[serde(default = "default_select_timeout_ms")]
    pub select_timeout_ms: u64,

    #[serde(default = "default_true")]
    pub smart_routing: bool,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            policy: LoadBalancePolicy::default(),
            select_timeout_ms: default_select_timeout_ms(),
            smart_routing: true,
        }
    }
}

impl RouterSettings {
    pub fn select_timeout(&self) -> Duration {
        Duration::from_millis(self.select_timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_audit_buffer")]
    pub buffer: usize,

    #[serde(default = "default_audit_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_audit_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// JSON-lines file; events go to the log when absent
    #[serde(default)]
    pub path: Option<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            buffer: default_audit_buffer(),
            batch_size: default_audit_batch_size(),
            flush_interval_ms: default_audit_flush_interval_ms(),
            path: None,
        }
    }
}

impl AuditConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process naming and config store
    #[default]
    Memory,
    /// Nacos-compatible open API over HTTP
    Nacos,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,

    #[serde(default = "default_server_addrs")]
    pub server_addrs: Vec<String>,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_context_path")]
    pub context_path: String,

    #[serde(default = "default_watch_interval_ms")]
    pub watch_interval_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            server_addrs: default_server_addrs(),
            username: String::new(),
            password: String::new(),
            context_path: default_context_path(),
            watch_interval_ms: default_watch_interval_ms(),
        }
    }
}

impl BackendConfig {
    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }
}

/// Rolling period of the log files
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Daily,
    Hourly,
    Never,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Rolling log directory; console only when absent
    #[serde(default)]
    pub dir: Option<String>,

    #[serde(default)]
    pub rotation: LogRotation,

    /// Also log to stdout
    #[serde(default = "default_true")]
    pub console: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
            rotation: LogRotation::default(),
            console: true,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Prometheus exporter address, e.g. `0.0.0.0:9090`
    #[serde(default)]
    pub listen: Option<String>,
}

/// Root configuration of the router
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub router: RouterSettings,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Backend servers registered at startup
    #[serde(default)]
    pub servers: Vec<McpServerInfo>,
}

impl RouterConfig {
    /// Load configuration from `path` (or `conf/application.yml` when present)
    /// overlaid with `MCP_ROUTER_` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let settings = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("registry.service_groups")
                    .with_list_parse_key("backend.server_addrs"),
            )
            .build()?;

        let config: RouterConfig = settings.try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.registry.default_group.trim().is_empty() {
            return Err(RouterError::Config("registry.default_group is empty".into()));
        }
        if self.registry.service_groups.is_empty() {
            return Err(RouterError::Config(
                "registry.service_groups must not be empty".into(),
            ));
        }
        if self.health.failure_threshold == 0 || self.health.success_threshold == 0 {
            return Err(RouterError::Config(
                "health thresholds must be greater than zero".into(),
            ));
        }
        if self.health.max_concurrent_probes == 0 {
            return Err(RouterError::Config(
                "health.max_concurrent_probes must be greater than zero".into(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0
            || self.circuit_breaker.success_threshold == 0
            || self.circuit_breaker.half_open_max_probes == 0
        {
            return Err(RouterError::Config(
                "circuit breaker thresholds must be greater than zero".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(RouterError::Config(
                "retry.max_attempts must be greater than zero".into(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(RouterError::Config(format!(
                "retry.multiplier must be >= 1.0, got {}",
                self.retry.multiplier
            )));
        }
        if self.backend.kind == BackendKind::Nacos && self.backend.server_addrs.is_empty() {
            return Err(RouterError::Config(
                "backend.server_addrs is required for the nacos backend".into(),
            ));
        }

        Ok(())
    }

    /// Groups searched for a service: the requested one first, then every configured group.
    pub fn search_groups(&self, requested: &str) -> Vec<String> {
        let mut groups = vec![requested.to_string()];
        for group in &self.registry.service_groups {
            if !groups.contains(group) {
                groups.push(group.clone());
            }
        }
        groups
    }
}

// Default functions for serde
fn default_true() -> bool {
    true
}

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

fn default_service_groups() -> Vec<String> {
    vec![DEFAULT_GROUP.to_string()]
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_remote_timeout_ms() -> u64 {
    3000
}

fn default_heartbeat_interval_ms() -> u64 {
    5000
}

fn default_cache_ttl_ms() -> u64 {
    30_000
}

fn default_query_timeout_ms() -> u64 {
    200
}

fn default_event_buffer() -> usize {
    256
}

fn default_retry_after_ms() -> u64 {
    5_000
}

fn default_health_interval_ms() -> u64 {
    30_000
}

fn default_probe_timeout_ms() -> u64 {
    10_000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_success_threshold() -> u32 {
    2
}

fn default_max_concurrent_probes() -> usize {
    16
}

fn default_reset_timeout_ms() -> u64 {
    30_000
}

fn default_half_open_max_probes() -> u32 {
    2
}

fn default_idle_grace_ms() -> u64 {
    300_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    2000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_select_timeout_ms() -> u64 {
    250
}

fn default_audit_buffer() -> usize {
    1024
}

fn default_audit_batch_size() -> usize {
    500
}

fn default_audit_flush_interval_ms() -> u64 {
    2000
}

fn default_server_addrs() -> Vec<String> {
    vec!["http://127.0.0.1:8848".to_string()]
}

fn default_context_path() -> String {
    "/nacos".to_string()
}

fn default_watch_interval_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}
