//! Protocol clients used by health probes
//!
//! `TcpProtocolClient` checks that the instance accepts connections.
//! `HttpProtocolClient` additionally requires the instance's SSE endpoint to
//! answer with a success status.

use std::time::Duration;

use async_trait::async_trait;
use mcp_router_api::{ProtocolClient, ProtocolSession, RemoteError, RemoteResult, ServiceInstance};
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

pub struct TcpProtocolClient {
    connect_timeout: Duration,
}

impl TcpProtocolClient {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpProtocolClient {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

#[async_trait]
impl ProtocolClient for TcpProtocolClient {
    async fn connect(&self, instance: &ServiceInstance) -> RemoteResult<Box<dyn ProtocolSession>> {
        let address = instance.address();
        match timeout(
            self.connect_timeout,
            TcpStream::connect((instance.host.as_str(), instance.port)),
        )
        .await
        {
            Ok(Ok(stream)) => Ok(Box::new(TcpSession { stream, address })),
            Ok(Err(e)) => Err(RemoteError::Unavailable(format!(
                "connect to {} failed: {}",
                address, e
            ))),
            Err(_) => Err(RemoteError::Timeout),
        }
    }

    fn name(&self) -> &str {
        "tcp"
    }
}

struct TcpSession {
    stream: TcpStream,
    address: String,
}

#[async_trait]
impl ProtocolSession for TcpSession {
    async fn ping(&mut self) -> RemoteResult<()> {
        let mut buf = [0u8; 1];
        match self.stream.try_read(&mut buf) {
            Ok(0) => Err(RemoteError::Unavailable(format!(
                "{} closed the connection",
                self.address
            ))),
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(RemoteError::Unavailable(format!(
                "{} is not readable: {}",
                self.address, e
            ))),
        }
    }

    async fn close(self: Box<Self>) {
        let mut session = self;
        if let Err(e) = session.stream.shutdown().await {
            debug!("Closing connection to {} failed: {}", session.address, e);
        }
    }
}

pub struct HttpProtocolClient {
    client: Client,
}

impl HttpProtocolClient {
    pub fn new(connect_timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().connect_timeout(connect_timeout).build()?;
        Ok(Self { client })
    }
}

/// `http://host:port` followed by the instance's SSE path
pub fn endpoint_url(instance: &ServiceInstance) -> String {
    let path = instance.sse_endpoint();
    if path.starts_with('/') {
        format!("http://{}{}", instance.address(), path)
    } else {
        format!("http://{}/{}", instance.address(), path)
    }
}

#[async_trait]
impl ProtocolClient for HttpProtocolClient {
    async fn connect(&self, instance: &ServiceInstance) -> RemoteResult<Box<dyn ProtocolSession>> {
        Ok(Box::new(HttpSession {
            client: self.client.clone(),
            url: endpoint_url(instance),
        }))
    }

    fn name(&self) -> &str {
        "http"
    }
}

struct HttpSession {
    client: Client,
    url: String,
}

#[async_trait]
impl ProtocolSession for HttpSession {
    async fn ping(&mut self) -> RemoteResult<()> {
        // the SSE body never ends; only the status line is read
        let response = self
            .client
            .get(&self.url)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RemoteError::Timeout
                } else {
                    RemoteError::Unavailable(format!("{}: {}", self.url, e))
                }
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(RemoteError::Rejected {
                code: i32::from(status.as_u16()),
                message: format!("{} returned {}", self.url, status),
            })
        }
    }

    async fn close(self: Box<Self>) {}
}
