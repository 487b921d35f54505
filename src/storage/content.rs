use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StoreError;

/// A content-addressed store: published bytes come back as an immutable id.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Publish `bytes` under a human readable `name`, returning its content id.
    async fn pin(&self, bytes: Bytes, name: &str) -> Result<String, StoreError>;

    /// Retrieve the bytes behind a content id.
    async fn fetch(&self, content_id: &str) -> Result<Bytes, StoreError>;

    /// Public URL the content can be retrieved from.
    fn gateway_url(&self, content_id: &str) -> String;
}
