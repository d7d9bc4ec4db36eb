//! The settings store backing user assets.

use std::sync::Arc;

use async_trait::async_trait;

use crate::backend::BackendResult;

/// Flat key/value text persistence for user assets (`user-*` keys).
///
/// User assets bypass the cache entirely; they are read from and written to
/// this store verbatim.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Reads a user asset.
    async fn read(&self, key: &str) -> BackendResult<Option<String>>;

    /// Writes a user asset, overwriting any previous value.
    async fn write(&self, key: &str, content: String) -> BackendResult<()>;
}

#[async_trait]
impl<T> SettingsStore for Arc<T>
where
    T: SettingsStore + ?Sized,
{
    async fn read(&self, key: &str) -> BackendResult<Option<String>> {
        (**self).read(key).await
    }

    async fn write(&self, key: &str, content: String) -> BackendResult<()> {
        (**self).write(key, content).await
    }
}
