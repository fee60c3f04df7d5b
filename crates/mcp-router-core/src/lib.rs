//! MCP Router Core - registry, health and routing
//!
//! This crate provides:
//! - Retried, rolled-back registration of MCP backend servers
//! - A TTL cache of instances kept current by registry watches
//! - Periodic health probing with hysteresis
//! - Per-service circuit breakers
//! - Instance selection with pluggable load-balancing policies
//! - Non-blocking audit of routing, health and registration events

pub mod audit;
pub mod cache;
pub mod circuit_breaker;
pub mod discovery;
pub mod health;
pub mod registrar;
pub mod registry;
pub mod router;
pub mod subscriber;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use audit::{
    AuditEvent, AuditSink, AuditWriter, ChannelAuditSink, JsonLinesAuditWriter, NoopAuditSink,
    TracingAuditWriter,
};
pub use cache::{CachedServiceView, InstanceCache};
pub use circuit_breaker::{CircuitBreakerRegistry, CircuitBreakerState, CircuitState, ProbePermit};
pub use discovery::ServiceDiscovery;
pub use health::{HealthMonitor, HealthRecord, HealthStats, HealthStatus};
pub use registrar::{Registrar, Registration};
pub use registry::McpRegistry;
pub use router::{
    ConnectionCounter, ConnectionTracker, InstanceLoadStats, LoadBalancerStats, Router,
};
pub use subscriber::RegistrySubscriber;
