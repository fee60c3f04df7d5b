//! MCP Router Common - shared errors, configuration and utilities
//!
//! This crate provides:
//! - The router error taxonomy (`RouterError`)
//! - Typed configuration loaded from YAML and environment (`RouterConfig`)
//! - A cloneable shutdown signal for background tasks
//! - Content fingerprint helpers

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod shutdown;

pub use config::{BackendKind, LoadBalancePolicy, ProbeKind, RouterConfig};
pub use error::{Result, RouterError};
pub use shutdown::{ShutdownSignal, run_with_shutdown};
