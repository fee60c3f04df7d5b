//! Config store client over `/v1/cs/configs`

use std::sync::Arc;

use async_trait::async_trait;
use mcp_router_api::{ConfigClient, RemoteResult};

use crate::error::Result;
use crate::http::NacosHttpClient;

const CONFIGS_PATH: &str = "/v1/cs/configs";

pub struct NacosConfigClient {
    http: Arc<NacosHttpClient>,
    namespace: String,
}

impl NacosConfigClient {
    pub fn new(http: Arc<NacosHttpClient>, namespace: &str) -> Self {
        Self {
            http,
            namespace: namespace.to_string(),
        }
    }

    /// The public namespace is addressed with an empty tenant.
    fn tenant(&self) -> String {
        if self.namespace == mcp_router_api::DEFAULT_NAMESPACE {
            String::new()
        } else {
            self.namespace.clone()
        }
    }

    async fn do_publish(&self, data_id: &str, group: &str, content: &str) -> Result<bool> {
        let form = [
            ("dataId", data_id.to_string()),
            ("group", group.to_string()),
            ("tenant", self.tenant()),
            ("content", content.to_string()),
            ("type", "json".to_string()),
        ];
        let body = self.http.post_form(CONFIGS_PATH, &form).await?;
        Ok(parse_bool(&body))
    }

    async fn do_get(&self, data_id: &str, group: &str) -> Result<Option<String>> {
        let query = [
            ("dataId", data_id.to_string()),
            ("group", group.to_string()),
            ("tenant", self.tenant()),
        ];
        match self.http.get_text(CONFIGS_PATH, &query).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn do_delete(&self, data_id: &str, group: &str) -> Result<bool> {
        let query = [
            ("dataId", data_id.to_string()),
            ("group", group.to_string()),
            ("tenant", self.tenant()),
        ];
        let body = self.http.delete_with_query(CONFIGS_PATH, &query).await?;
        Ok(parse_bool(&body))
    }
}

fn parse_bool(body: &str) -> bool {
    body.trim().eq_ignore_ascii_case("true")
}

#[async_trait]
impl ConfigClient for NacosConfigClient {
    async fn publish(&self, data_id: &str, group: &str, content: &str) -> RemoteResult<bool> {
        Ok(self.do_publish(data_id, group, content).await?)
    }

    async fn get(&self, data_id: &str, group: &str) -> RemoteResult<Option<String>> {
        Ok(self.do_get(data_id, group).await?)
    }

    async fn delete(&self, data_id: &str, group: &str) -> RemoteResult<bool> {
        Ok(self.do_delete(data_id, group).await?)
    }
}
