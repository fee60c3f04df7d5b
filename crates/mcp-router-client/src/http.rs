//! HTTP client with authentication and failover
//!
//! Shared by the Nacos naming and config clients. Requests go to the current
//! server; a transport error moves on to the next configured address.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{ClientError, Result};

/// Form or query parameters of one request
pub type Params<'a> = [(&'a str, String)];

/// Configuration for the HTTP client
#[derive(Clone, Debug)]
pub struct HttpClientConfig {
    /// Server base URLs, e.g. `http://127.0.0.1:8848`
    pub server_addrs: Vec<String>,
    /// Username; authentication is skipped when empty
    pub username: String,
    pub password: String,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    /// Context path (e.g., "/nacos")
    pub context_path: String,
    pub auth_endpoint: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            server_addrs: vec!["http://127.0.0.1:8848".to_string()],
            username: String::new(),
            password: String::new(),
            connect_timeout_ms: 3000,
            read_timeout_ms: 5000,
            context_path: "/nacos".to_string(),
            auth_endpoint: "/v1/auth/login".to_string(),
        }
    }
}

impl HttpClientConfig {
    pub fn new(server_addr: &str) -> Self {
        Self {
            server_addrs: vec![server_addr.to_string()],
            ..Default::default()
        }
    }

    pub fn with_servers(server_addrs: Vec<String>) -> Self {
        Self {
            server_addrs,
            ..Default::default()
        }
    }

    pub fn with_auth(mut self, username: &str, password: &str) -> Self {
        self.username = username.to_string();
        self.password = password.to_string();
        self
    }

    pub fn with_timeouts(mut self, connect_ms: u64, read_ms: u64) -> Self {
        self.connect_timeout_ms = connect_ms;
        self.read_timeout_ms = read_ms;
        self
    }

    pub fn with_context_path(mut self, path: &str) -> Self {
        self.context_path = path.to_string();
        self
    }
}

#[derive(Clone, Debug)]
struct TokenInfo {
    access_token: String,
    expires_at: Instant,
}

/// HTTP client for a Nacos-compatible open API
pub struct NacosHttpClient {
    client: Client,
    config: HttpClientConfig,
    current_server_index: AtomicUsize,
    token: RwLock<Option<TokenInfo>>,
}

impl NacosHttpClient {
    /// Build the client. Authentication happens lazily on the first request.
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        if config.server_addrs.is_empty() {
            return Err(ClientError::NoServer);
        }

        let client = Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.read_timeout_ms))
            .build()?;

        Ok(Self {
            client,
            config,
            current_server_index: AtomicUsize::new(0),
            token: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }

    fn auth_enabled(&self) -> bool {
        !self.config.username.is_empty()
    }

    fn current_server(&self) -> &str {
        let index = self.current_server_index.load(Ordering::Relaxed) % self.config.server_addrs.len();
        &self.config.server_addrs[index]
    }

    fn switch_to_next_server(&self) {
        let index = self.current_server_index.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            "Switched to server index: {}",
            index % self.config.server_addrs.len()
        );
    }

    /// Build full URL with context path
    fn build_url(&self, path: &str) -> String {
        let base_url = self.current_server().trim_end_matches('/');
        let context_path = self.config.context_path.trim_matches('/');

        if context_path.is_empty() {
            format!("{}{}", base_url, path)
        } else {
            format!("{}/{}{}", base_url, context_path, path)
        }
    }

    fn get_token(&self) -> Option<String> {
        let token = self.token.read();
        token.as_ref().and_then(|t| {
            // refresh five minutes ahead of expiry
            if t.expires_at > Instant::now() + Duration::from_secs(300) {
                Some(t.access_token.clone())
            } else {
                None
            }
        })
    }

    fn set_token(&self, access_token: String, ttl_seconds: u64) {
        *self.token.write() = Some(TokenInfo {
            access_token,
            expires_at: Instant::now() + Duration::from_secs(ttl_seconds),
        });
    }

    /// Log in with the configured credentials
    pub async fn authenticate(&self) -> Result<()> {
        let url = self.build_url(&self.config.auth_endpoint);
        debug!("Authenticating with server: {}", url);

        let response = self
            .client
            .post(&url)
            .form(&[
                ("username", &self.config.username),
                ("password", &self.config.password),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ClientError::AuthFailed(format!(
                "login returned status {}",
                response.status()
            )));
        }

        let result: serde_json::Value = response.json().await?;
        let Some(access_token) = result.get("accessToken").and_then(|v| v.as_str()) else {
            return Err(ClientError::AuthFailed("no accessToken in login response".into()));
        };
        let ttl = result
            .get("tokenTtl")
            .and_then(|v| v.as_u64())
            .unwrap_or(18000);

        self.set_token(access_token.to_string(), ttl);
        debug!("Authentication successful, token expires in {} seconds", ttl);
        Ok(())
    }

    async fn ensure_token(&self) -> Result<Option<String>> {
        if !self.auth_enabled() {
            return Ok(None);
        }
        if let Some(token) = self.get_token() {
            return Ok(Some(token));
        }

        self.authenticate().await?;
        self.get_token()
            .map(Some)
            .ok_or_else(|| ClientError::AuthFailed("no token after authentication".into()))
    }

    pub async fn get_text(&self, path: &str, query: &Params<'_>) -> Result<String> {
        self.request_with_retry(
            |client, url, token| async move {
                with_token(client.get(&url), token).query(query).send().await
            },
            path,
        )
        .await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &Params<'_>) -> Result<T> {
        let text = self.get_text(path, query).await?;
        serde_json::from_str(&text)
            .map_err(|e| ClientError::InvalidResponse(format!("{}: {}", path, e)))
    }

    pub async fn post_form(&self, path: &str, form: &Params<'_>) -> Result<String> {
        self.request_with_retry(
            |client, url, token| async move {
                with_token(client.post(&url), token).form(form).send().await
            },
            path,
        )
        .await
    }

    pub async fn put_form(&self, path: &str, form: &Params<'_>) -> Result<String> {
        self.request_with_retry(
            |client, url, token| async move {
                with_token(client.put(&url), token).form(form).send().await
            },
            path,
        )
        .await
    }

    pub async fn delete_with_query(&self, path: &str, query: &Params<'_>) -> Result<String> {
        self.request_with_retry(
            |client, url, token| async move {
                with_token(client.delete(&url), token)
                    .query(query)
                    .send()
                    .await
            },
            path,
        )
        .await
    }

    /// Try each configured server once, re-authenticating on 401/403.
    async fn request_with_retry<F, Fut>(&self, request_fn: F, path: &str) -> Result<String>
    where
        F: Fn(Client, String, Option<String>) -> Fut,
        Fut: Future<Output = std::result::Result<Response, reqwest::Error>>,
    {
        let max_retries = self.config.server_addrs.len();
        let mut last_error = None;

        for _ in 0..max_retries {
            let url = self.build_url(path);
            let token = self.ensure_token().await?;

            match request_fn(self.client.clone(), url, token).await {
                Ok(response) => {
                    let status = response.status();
                    if self.auth_enabled()
                        && (status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN)
                    {
                        warn!("Token rejected, re-authenticating...");
                        *self.token.write() = None;
                        self.authenticate().await?;
                        last_error = Some(ClientError::AuthFailed(format!(
                            "{} returned {}",
                            path, status
                        )));
                        continue;
                    }
                    return handle_response(response).await;
                }
                Err(e) => {
                    warn!("Request failed: {}, switching to next server", e);
                    self.switch_to_next_server();
                    last_error = Some(e.into());
                }
            }
        }

        Err(last_error.unwrap_or(ClientError::NoServer))
    }
}

fn with_token(request: RequestBuilder, token: Option<String>) -> RequestBuilder {
    match token {
        Some(token) => request.header("accessToken", token),
        None => request,
    }
}

async fn handle_response(response: Response) -> Result<String> {
    let status = response.status();
    let body = response.text().await?;

    if status.is_success() {
        Ok(body)
    } else {
        debug!("Request failed with status {}: {}", status, body);
        Err(ClientError::ServerError {
            code: i32::from(status.as_u16()),
            message: body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = HttpClientConfig::default();
        assert_eq!(config.server_addrs, vec!["http://127.0.0.1:8848"]);
        assert!(config.username.is_empty());
        assert_eq!(config.context_path, "/nacos");
    }

    #[test]
    fn test_config_builder() {
        let config = HttpClientConfig::new("http://localhost:8848")
            .with_auth("admin", "secret")
            .with_timeouts(1000, 2000)
            .with_context_path("");

        assert_eq!(config.username, "admin");
        assert_eq!(config.password, "secret");
        assert_eq!(config.connect_timeout_ms, 1000);
        assert_eq!(config.read_timeout_ms, 2000);
        assert!(config.context_path.is_empty());
    }

    #[test]
    fn test_build_url() {
        let client = NacosHttpClient::new(HttpClientConfig::new("http://localhost:8848/")).unwrap();
        assert_eq!(
            client.build_url("/v1/ns/instance"),
            "http://localhost:8848/nacos/v1/ns/instance"
        );

        let client = NacosHttpClient::new(
            HttpClientConfig::new("http://localhost:8848").with_context_path(""),
        )
        .unwrap();
        assert_eq!(
            client.build_url("/v1/cs/configs"),
            "http://localhost:8848/v1/cs/configs"
        );
    }

    #[test]
    fn test_failover_cycles_servers() {
        let client = NacosHttpClient::new(HttpClientConfig::with_servers(vec![
            "http://a:8848".to_string(),
            "http://b:8848".to_string(),
        ]))
        .unwrap();

        assert_eq!(client.current_server(), "http://a:8848");
        client.switch_to_next_server();
        assert_eq!(client.current_server(), "http://b:8848");
        client.switch_to_next_server();
        assert_eq!(client.current_server(), "http://a:8848");
    }

    #[test]
    fn test_empty_server_list_is_rejected() {
        let result = NacosHttpClient::new(HttpClientConfig::with_servers(Vec::new()));
        assert!(matches!(result, Err(ClientError::NoServer)));
    }

    #[tokio::test]
    async fn test_no_token_without_credentials() {
        let client = NacosHttpClient::new(HttpClientConfig::default()).unwrap();
        assert!(client.ensure_token().await.unwrap().is_none());
    }
}
