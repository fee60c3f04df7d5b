//! Config-store descriptors published for every registered server
//!
//! Each registration publishes three documents, always in this order:
//! the server descriptor, the tool descriptor and the version descriptor.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::model::{McpServerInfo, ToolDefinition};

pub const SERVER_GROUP: &str = "mcp-server";
pub const TOOLS_GROUP: &str = "mcp-tools";
pub const VERSIONS_GROUP: &str = "mcp-server-versions";

pub const SERVER_CONFIG_SUFFIX: &str = "-mcp-server.json";
pub const TOOLS_CONFIG_SUFFIX: &str = "-mcp-tools.json";
pub const VERSIONS_CONFIG_SUFFIX: &str = "-mcp-versions.json";

pub const DEFAULT_PROTOCOL: &str = "mcp-sse";
pub const CAPABILITY_TOOL: &str = "TOOL";

pub fn server_data_id(id: &str, version: &str) -> String {
    format!("{}-{}{}", id, version, SERVER_CONFIG_SUFFIX)
}

pub fn tools_data_id(id: &str, version: &str) -> String {
    format!("{}-{}{}", id, version, TOOLS_CONFIG_SUFFIX)
}

pub fn versions_data_id(id: &str) -> String {
    format!("{}{}", id, VERSIONS_CONFIG_SUFFIX)
}

/// Kind of a published descriptor
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Server,
    Tools,
    Version,
}

impl ArtifactKind {
    /// Publication order
    pub const ORDERED: [ArtifactKind; 3] =
        [ArtifactKind::Server, ArtifactKind::Tools, ArtifactKind::Version];

    pub fn group(&self) -> &'static str {
        match self {
            ArtifactKind::Server => SERVER_GROUP,
            ArtifactKind::Tools => TOOLS_GROUP,
            ArtifactKind::Version => VERSIONS_GROUP,
        }
    }

    pub fn data_id(&self, id: &str, version: &str) -> String {
        match self {
            ArtifactKind::Server => server_data_id(id, version),
            ArtifactKind::Tools => tools_data_id(id, version),
            ArtifactKind::Version => versions_data_id(id),
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactKind::Server => write!(f, "server"),
            ArtifactKind::Tools => write!(f, "tools"),
            ArtifactKind::Version => write!(f, "version"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionDetail {
    pub version: String,
    pub release_date: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRef {
    pub namespace_id: String,
    pub group_name: String,
    pub service_name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteServerConfig {
    pub service_ref: ServiceRef,
    pub export_path: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerDescriptor {
    pub id: String,
    pub name: String,
    pub protocol: String,
    pub front_protocol: String,
    pub description: String,
    pub version_detail: VersionDetail,
    pub remote_server_config: RemoteServerConfig,
    pub enabled: bool,
    pub capabilities: Vec<String>,
    pub tools_description_ref: String,
}

impl McpServerDescriptor {
    pub fn new(info: &McpServerInfo, id: &str, release_date: &str) -> Self {
        Self {
            id: id.to_string(),
            name: info.name.clone(),
            protocol: DEFAULT_PROTOCOL.to_string(),
            front_protocol: DEFAULT_PROTOCOL.to_string(),
            description: info.description.clone().unwrap_or_else(|| info.name.clone()),
            version_detail: VersionDetail {
                version: info.version.clone(),
                release_date: release_date.to_string(),
            },
            remote_server_config: RemoteServerConfig {
                service_ref: ServiceRef {
                    namespace_id: info.namespace.clone(),
                    group_name: info.group.clone(),
                    service_name: info.name.clone(),
                },
                export_path: info.sse_endpoint.clone(),
            },
            enabled: true,
            capabilities: vec![CAPABILITY_TOOL.to_string()],
            tools_description_ref: tools_data_id(id, &info.version),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

impl From<&ToolDefinition> for McpToolDescriptor {
    fn from(tool: &ToolDefinition) -> Self {
        Self {
            name: tool.name.clone(),
            description: tool.description.clone(),
            input_schema: tool.input_schema.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpToolsDescriptor {
    pub tools: Vec<McpToolDescriptor>,
    #[serde(default)]
    pub tools_meta: HashMap<String, serde_json::Value>,
}

impl McpToolsDescriptor {
    pub fn new(info: &McpServerInfo) -> Self {
        Self {
            tools: info.tools.iter().map(McpToolDescriptor::from).collect(),
            tools_meta: HashMap::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpVersionDescriptor {
    pub id: String,
    pub name: String,
    pub protocol: String,
    pub front_protocol: String,
    pub description: String,
    pub enabled: bool,
    pub capabilities: Vec<String>,
    pub latest_published_version: String,
    pub version_details: Vec<VersionDetail>,
}

impl McpVersionDescriptor {
    pub fn new(info: &McpServerInfo, id: &str, release_date: &str) -> Self {
        Self {
            id: id.to_string(),
            name: info.name.clone(),
            protocol: DEFAULT_PROTOCOL.to_string(),
            front_protocol: DEFAULT_PROTOCOL.to_string(),
            description: info.description.clone().unwrap_or_else(|| info.name.clone()),
            enabled: true,
            capabilities: vec![CAPABILITY_TOOL.to_string()],
            latest_published_version: info.version.clone(),
            version_details: vec![VersionDetail {
                version: info.version.clone(),
                release_date: release_date.to_string(),
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> McpServerInfo {
        McpServerInfo::new("person-server", "10.0.0.1", 8080)
            .with_version("1.2.0")
            .with_tool(ToolDefinition::new("getPerson", "Get a person"))
    }

    #[test]
    fn test_data_ids() {
        assert_eq!(server_data_id("abc", "1.0.0"), "abc-1.0.0-mcp-server.json");
        assert_eq!(tools_data_id("abc", "1.0.0"), "abc-1.0.0-mcp-tools.json");
        assert_eq!(versions_data_id("abc"), "abc-mcp-versions.json");
    }

    #[test]
    fn test_artifact_order_and_groups() {
        let groups: Vec<_> = ArtifactKind::ORDERED.iter().map(|k| k.group()).collect();
        assert_eq!(groups, vec![SERVER_GROUP, TOOLS_GROUP, VERSIONS_GROUP]);
        assert_eq!(
            ArtifactKind::Version.data_id("abc", "9.9.9"),
            "abc-mcp-versions.json"
        );
    }

    #[test]
    fn test_server_descriptor_json_layout() {
        let descriptor = McpServerDescriptor::new(&info(), "abc", "2026-01-01T00:00:00Z");
        let json = serde_json::to_value(&descriptor).unwrap();

        assert_eq!(json["protocol"], "mcp-sse");
        assert_eq!(json["frontProtocol"], "mcp-sse");
        assert_eq!(json["versionDetail"]["version"], "1.2.0");
        assert_eq!(json["versionDetail"]["release_date"], "2026-01-01T00:00:00Z");
        assert_eq!(
            json["remoteServerConfig"]["serviceRef"]["serviceName"],
            "person-server"
        );
        assert_eq!(json["remoteServerConfig"]["exportPath"], "/sse");
        assert_eq!(json["toolsDescriptionRef"], "abc-1.2.0-mcp-tools.json");
        assert_eq!(json["capabilities"][0], "TOOL");
    }

    #[test]
    fn test_tools_descriptor() {
        let descriptor = McpToolsDescriptor::new(&info());
        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["tools"][0]["name"], "getPerson");
        assert_eq!(json["tools"][0]["inputSchema"]["type"], "object");
        assert!(json["toolsMeta"].as_object().unwrap().is_empty());
    }

    #[test]
    fn test_version_descriptor() {
        let descriptor = McpVersionDescriptor::new(&info(), "abc", "now");
        assert_eq!(descriptor.latest_published_version, "1.2.0");
        assert_eq!(descriptor.version_details.len(), 1);
    }
}
