//! Application startup utilities.

mod backend;
mod logging;
mod metrics;
mod registration;
mod shutdown;

pub use backend::{Collaborators, build_collaborators};
pub use logging::{LogRotation, LogSettings, LoggingGuard, init_logging};
pub use metrics::{describe_metrics, init_metrics, parse_listen_addr};
pub use registration::register_servers;
pub use shutdown::wait_for_shutdown_signal;
