//! The blob-store trait backing registries and cached content.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::BackendError;

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Key/value blob persistence.
///
/// The engine stores three kinds of values through this trait: the two
/// registry snapshots (JSON blobs) and per-asset content at `cache/<key>`.
/// Values are opaque bytes; interpretation stays with the caller.
///
/// # Dyn-Compatibility
///
/// This trait is dyn-compatible; a blanket implementation is provided for
/// `Arc<T>` so an `Arc<dyn Storage>` can be shared freely.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Reads a value by key.
    ///
    /// Returns `Ok(Some(bytes))` on hit, `Ok(None)` on miss.
    async fn get(&self, key: &str) -> BackendResult<Option<Bytes>>;

    /// Writes a batch of values.
    async fn set(&self, entries: Vec<(String, Bytes)>) -> BackendResult<()>;

    /// Removes a batch of keys; missing keys are not an error.
    async fn remove(&self, keys: &[String]) -> BackendResult<()>;
}

#[async_trait]
impl<T> Storage for Arc<T>
where
    T: Storage + ?Sized,
{
    async fn get(&self, key: &str) -> BackendResult<Option<Bytes>> {
        (**self).get(key).await
    }

    async fn set(&self, entries: Vec<(String, Bytes)>) -> BackendResult<()> {
        (**self).set(entries).await
    }

    async fn remove(&self, keys: &[String]) -> BackendResult<()> {
        (**self).remove(keys).await
    }
}
