//! Error taxonomy of the router core
//!
//! Only request-path operations (registration, selection) return these to
//! callers. Background tasks log them and continue.

use std::time::Duration;

use mcp_router_api::RemoteError;

/// Router error types
#[derive(thiserror::Error, Debug)]
pub enum RouterError {
    #[error("registration failed for service '{service}': {reason}")]
    RegistrationFailed { service: String, reason: String },

    #[error("deregistration of service '{service}' only partially completed: {reason}")]
    DeregistrationPartial { service: String, reason: String },

    #[error("no healthy instance available for service '{0}'")]
    NoHealthyInstance(String),

    #[error("probe of {instance} failed: {reason}")]
    ProbeFailed { instance: String, reason: String },

    #[error("registry unavailable: {0}")]
    RegistryUnavailable(String),

    #[error("invalid instance: {0}")]
    InvalidInstance(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation cancelled by shutdown")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RouterError {
    /// Transient failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RouterError::RegistryUnavailable(_)
                | RouterError::Timeout(_)
                | RouterError::ProbeFailed { .. }
        )
    }

    /// Short label used as a metrics dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            RouterError::RegistrationFailed { .. } => "registration_failed",
            RouterError::DeregistrationPartial { .. } => "deregistration_partial",
            RouterError::NoHealthyInstance(_) => "no_healthy_instance",
            RouterError::ProbeFailed { .. } => "probe_failed",
            RouterError::RegistryUnavailable(_) => "registry_unavailable",
            RouterError::InvalidInstance(_) => "invalid_instance",
            RouterError::Timeout(_) => "timeout",
            RouterError::Cancelled => "cancelled",
            RouterError::Config(_) => "config",
            RouterError::Other(_) => "other",
        }
    }
}

impl From<RemoteError> for RouterError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Timeout => RouterError::RegistryUnavailable("remote call timed out".into()),
            other => RouterError::RegistryUnavailable(other.to_string()),
        }
    }
}

impl From<config::ConfigError> for RouterError {
    fn from(err: config::ConfigError) -> Self {
        RouterError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RouterError>;
