//! MCP Router Client - collaborator implementations
//!
//! This crate provides:
//! - In-process naming registry and config store (`memory`)
//! - An HTTP client with login and server failover (`http`)
//! - Naming and config clients for a Nacos-compatible v1 API (`nacos`)
//! - TCP and HTTP protocol clients for health probes (`protocol`)

pub mod error;
pub mod http;
pub mod memory;
pub mod nacos;
pub mod protocol;

// Re-export commonly used types
pub use error::{ClientError, Result};
pub use http::{HttpClientConfig, NacosHttpClient};
pub use memory::{MemoryConfigClient, MemoryNamingClient};
pub use nacos::{NacosConfigClient, NacosNamingClient};
pub use protocol::{HttpProtocolClient, TcpProtocolClient};
