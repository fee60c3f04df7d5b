//! Clients for a Nacos-compatible v1 open API

pub mod config;
pub mod naming;

pub use config::NacosConfigClient;
pub use naming::NacosNamingClient;

/// Join a group and service name the way the server keys services.
pub(crate) fn grouped_service_name(group: &str, service_name: &str) -> String {
    mcp_router_api::build_service_key(group, service_name)
}
