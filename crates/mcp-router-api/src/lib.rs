//! MCP Router API - model types and collaborator contracts
//!
//! This crate provides:
//! - Instance and registration models (`ServiceInstance`, `McpServerInfo`)
//! - Config descriptor documents published alongside a registration
//! - The contracts consumed by the router core: naming registry,
//!   config store and protocol client

pub mod config_store;
pub mod descriptor;
pub mod error;
pub mod model;
pub mod naming;
pub mod protocol;

// Re-export commonly used types
pub use config_store::ConfigClient;
pub use error::{RemoteError, RemoteResult};
pub use model::*;
pub use naming::{EventListener, FnEventListener, NamingClient, NamingEvent};
pub use protocol::{ProtocolClient, ProtocolSession};
