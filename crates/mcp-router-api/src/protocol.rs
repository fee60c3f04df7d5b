//! Application-protocol client used for health probes

use async_trait::async_trait;

use crate::error::RemoteResult;
use crate::model::ServiceInstance;

/// Opens sessions to backend instances.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    async fn connect(&self, instance: &ServiceInstance) -> RemoteResult<Box<dyn ProtocolSession>>;

    /// Short name used in logs, e.g. `tcp` or `http`
    fn name(&self) -> &str;
}

/// An open handle to one instance.
#[async_trait]
pub trait ProtocolSession: Send {
    async fn ping(&mut self) -> RemoteResult<()>;

    async fn close(self: Box<Self>);
}
