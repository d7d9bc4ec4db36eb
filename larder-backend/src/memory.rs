//! In-memory backend implementation.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use crate::backend::{BackendResult, Storage};
use crate::settings::SettingsStore;

/// Concurrent in-memory blob store.
///
/// Backed by a `DashMap`, so reads and writes from concurrent tasks do not
/// contend on a single lock. Clones share the same store. Data is not
/// persisted across process restarts; products wire their own [`Storage`]
/// implementation for that.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    entries: Arc<DashMap<String, Bytes>>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        MemoryBackend::default()
    }

    /// Number of stored entries.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// `true` when a key is present.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

#[async_trait]
impl Storage for MemoryBackend {
    async fn get(&self, key: &str) -> BackendResult<Option<Bytes>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn set(&self, entries: Vec<(String, Bytes)>) -> BackendResult<()> {
        for (key, value) in entries {
            self.entries.insert(key, value);
        }
        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> BackendResult<()> {
        for key in keys {
            self.entries.remove(key);
        }
        Ok(())
    }
}

/// Concurrent in-memory settings store. Clones share the same store.
#[derive(Debug, Default, Clone)]
pub struct MemorySettings {
    entries: Arc<DashMap<String, String>>,
}

impl MemorySettings {
    /// Creates an empty store.
    pub fn new() -> Self {
        MemorySettings::default()
    }
}

#[async_trait]
impl SettingsStore for MemorySettings {
    async fn read(&self, key: &str) -> BackendResult<Option<String>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn write(&self, key: &str, content: String) -> BackendResult<()> {
        self.entries.insert(key.to_string(), content);
        Ok(())
    }
}
