//! Instance and registration models
//!
//! `ServiceInstance` is what the registry stores and the router hands out.
//! `McpServerInfo` is the registration request for one backend tool-server.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

// Instance metadata keys
pub const METADATA_VERSION: &str = "version";
pub const METADATA_SSE_ENDPOINT: &str = "sseEndpoint";
pub const METADATA_SERVER_MD5: &str = "server.md5";
pub const METADATA_TOOLS_NAMES: &str = "tools.names";

pub const DEFAULT_GROUP: &str = "mcp-server";
pub const DEFAULT_NAMESPACE: &str = "public";
pub const DEFAULT_VERSION: &str = "1.0.0";
pub const DEFAULT_SSE_ENDPOINT: &str = "/sse";

/// Service name (or group) matching every service
pub const WILDCARD: &str = "*";

/// Build a cache key from group and service name.
pub fn build_service_key(group: &str, service_name: &str) -> String {
    format!("{}@@{}", group, service_name)
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Identity of a service inside the registry: `(serviceName, group)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    pub service_name: String,
    pub group: String,
}

impl ServiceKey {
    pub fn new(service_name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            group: group.into(),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.service_name == WILDCARD
    }
}

impl Display for ServiceKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", build_service_key(&self.group, &self.service_name))
    }
}

/// Identity tuple of one instance: `(serviceName, group, host, port)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    pub service_name: String,
    pub group: String,
    pub host: String,
    pub port: u16,
}

impl InstanceKey {
    pub fn service_key(&self) -> ServiceKey {
        ServiceKey::new(self.service_name.clone(), self.group.clone())
    }

    /// `host:port`, the identity used when de-duplicating across groups
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Display for InstanceKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}#{}#{}",
            build_service_key(&self.group, &self.service_name),
            self.host,
            self.port
        )
    }
}

/// One running backend process as known to the registry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceInstance {
    pub service_name: String,
    pub group: String,
    pub host: String,
    pub port: u16,
    pub weight: f64,
    /// Health as reported by the registry backend
    pub healthy: bool,
    pub enabled: bool,
    pub ephemeral: bool,
    pub metadata: HashMap<String, String>,
    /// Last time this instance was observed, in milliseconds since the epoch
    pub last_seen: i64,
}

impl Default for ServiceInstance {
    fn default() -> Self {
        Self {
            service_name: String::new(),
            group: DEFAULT_GROUP.to_string(),
            host: String::new(),
            port: 0,
            weight: 1.0,
            healthy: true,
            enabled: true,
            ephemeral: true,
            metadata: HashMap::new(),
            last_seen: now_millis(),
        }
    }
}

impl ServiceInstance {
    pub fn new(
        service_name: impl Into<String>,
        group: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            group: group.into(),
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn key(&self) -> InstanceKey {
        InstanceKey {
            service_name: self.service_name.clone(),
            group: self.group.clone(),
            host: self.host.clone(),
            port: self.port,
        }
    }

    pub fn service_key(&self) -> ServiceKey {
        ServiceKey::new(self.service_name.clone(), self.group.clone())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Same `(serviceName, group, host, port)` tuple
    pub fn same_identity(&self, other: &ServiceInstance) -> bool {
        self.service_name == other.service_name
            && self.group == other.group
            && self.host == other.host
            && self.port == other.port
    }

    pub fn is_routable(&self) -> bool {
        self.healthy && self.enabled
    }

    pub fn version(&self) -> Option<&str> {
        self.metadata.get(METADATA_VERSION).map(String::as_str)
    }

    pub fn sse_endpoint(&self) -> &str {
        self.metadata
            .get(METADATA_SSE_ENDPOINT)
            .map(String::as_str)
            .unwrap_or(DEFAULT_SSE_ENDPOINT)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.metadata
            .get(METADATA_TOOLS_NAMES)
            .map(|names| {
                names
                    .split(',')
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Mark the instance as observed now.
    pub fn touch(&mut self) {
        self.last_seen = now_millis();
    }
}

/// One entry of a server's static tool table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_input_schema")]
    pub input_schema: serde_json::Value,
}

fn default_input_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {},
        "required": [],
        "additionalProperties": false
    })
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: default_input_schema(),
        }
    }

    pub fn with_input_schema(mut self, input_schema: serde_json::Value) -> Self {
        self.input_schema = input_schema;
        self
    }
}

/// Registration request for one backend MCP server instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct McpServerInfo {
    /// Descriptor id; derived from the service name when absent
    pub id: Option<String>,
    pub name: String,
    pub group: String,
    pub namespace: String,
    pub host: String,
    pub port: u16,
    pub version: String,
    pub sse_endpoint: String,
    pub description: Option<String>,
    pub weight: f64,
    pub ephemeral: bool,
    pub tools: Vec<ToolDefinition>,
    pub metadata: HashMap<String, String>,
}

impl Default for McpServerInfo {
    fn default() -> Self {
        Self {
            id: None,
            name: String::new(),
            group: DEFAULT_GROUP.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            host: String::new(),
            port: 0,
            version: DEFAULT_VERSION.to_string(),
            sse_endpoint: DEFAULT_SSE_ENDPOINT.to_string(),
            description: None,
            weight: 1.0,
            ephemeral: true,
            tools: Vec::new(),
            metadata: HashMap::new(),
        }
    }
}

impl McpServerInfo {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_sse_endpoint(mut self, sse_endpoint: impl Into<String>) -> Self {
        self.sse_endpoint = sse_endpoint.into();
        self
    }

    pub fn with_tool(mut self, tool: ToolDefinition) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn service_key(&self) -> ServiceKey {
        ServiceKey::new(self.name.clone(), self.group.clone())
    }

    /// Comma-joined tool names, the `tools.names` metadata value
    pub fn tool_names(&self) -> String {
        self.tools
            .iter()
            .map(|t| t.name.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Build the registry instance; fingerprint metadata is attached by the registrar.
    pub fn to_instance(&self) -> ServiceInstance {
        let mut instance = ServiceInstance::new(
            self.name.clone(),
            self.group.clone(),
            self.host.clone(),
            self.port,
        );
        instance.weight = self.weight;
        instance.ephemeral = self.ephemeral;
        instance.metadata = self.metadata.clone();
        instance
            .metadata
            .insert(METADATA_VERSION.to_string(), self.version.clone());
        instance
            .metadata
            .insert(METADATA_SSE_ENDPOINT.to_string(), self.sse_endpoint.clone());
        if !self.tools.is_empty() {
            instance
                .metadata
                .insert(METADATA_TOOLS_NAMES.to_string(), self.tool_names());
        }
        instance
    }
}
