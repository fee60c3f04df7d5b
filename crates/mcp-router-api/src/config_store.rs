//! Key/value config store contract

use async_trait::async_trait;

use crate::error::RemoteResult;

/// Config store keyed by `(data_id, group)`.
#[async_trait]
pub trait ConfigClient: Send + Sync {
    /// Returns `false` when the store refused the content.
    async fn publish(&self, data_id: &str, group: &str, content: &str) -> RemoteResult<bool>;

    async fn get(&self, data_id: &str, group: &str) -> RemoteResult<Option<String>>;

    /// Returns `false` when nothing was deleted.
    async fn delete(&self, data_id: &str, group: &str) -> RemoteResult<bool>;
}
