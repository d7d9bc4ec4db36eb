//! Shared test doubles and seeding helpers.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use larder::backend::{MemoryBackend, Storage};
use larder::{AssetError, FetchedText, TextFetcher};
use larder_core::{extract_field, parse_last_modified};

/// A canned-response fetcher; clones share state.
#[derive(Clone, Default)]
pub struct StaticFetcher {
    inner: Arc<StaticFetcherInner>,
}

#[derive(Default)]
struct StaticFetcherInner {
    bodies: Mutex<HashMap<String, String>>,
    hits: Mutex<Vec<String>>,
    remote_server_friendly: AtomicBool,
}

impl StaticFetcher {
    pub fn new() -> Self {
        StaticFetcher::default()
    }

    pub fn with(self, url: &str, body: &str) -> Self {
        self.set(url, body);
        self
    }

    pub fn set(&self, url: &str, body: &str) {
        self.inner
            .bodies
            .lock()
            .unwrap()
            .insert(url.to_string(), body.to_string());
    }

    pub fn hits(&self) -> Vec<String> {
        self.inner.hits.lock().unwrap().clone()
    }

    pub fn hit_count(&self, url: &str) -> usize {
        self.inner
            .hits
            .lock()
            .unwrap()
            .iter()
            .filter(|hit| *hit == url)
            .count()
    }
}

#[async_trait]
impl TextFetcher for StaticFetcher {
    async fn fetch_text(&self, url: &str) -> FetchedText {
        self.inner.hits.lock().unwrap().push(url.to_string());
        let body = self.inner.bodies.lock().unwrap().get(url).cloned();
        match body {
            Some(content) => FetchedText {
                url: url.to_string(),
                resource_time: extract_field(&content, "Last-Modified")
                    .map(|value| parse_last_modified(&value))
                    .unwrap_or(0),
                content,
                status: Some(200),
                error: None,
            },
            None => FetchedText::failure(
                url,
                AssetError::CantConnect {
                    url: url.to_string(),
                },
            ),
        }
    }

    fn set_remote_server_friendly(&self, on: bool) {
        self.inner
            .remote_server_friendly
            .store(on, Ordering::Relaxed);
    }

    fn remote_server_friendly(&self) -> bool {
        self.inner.remote_server_friendly.load(Ordering::Relaxed)
    }
}

/// Seeds both registry snapshots and content blobs through the storage
/// contract, the way a previous run would have persisted them.
pub async fn seed_registries(
    backend: &MemoryBackend,
    sources: serde_json::Value,
    cache: serde_json::Value,
    blobs: &[(&str, &str)],
) {
    let mut entries = vec![
        (
            "assetSourceRegistry".to_string(),
            Bytes::from(sources.to_string()),
        ),
        (
            "assetCacheRegistry".to_string(),
            Bytes::from(cache.to_string()),
        ),
    ];
    for (key, content) in blobs {
        entries.push((format!("cache/{key}"), Bytes::from(content.to_string())));
    }
    backend.set(entries).await.unwrap();
}

/// Reads a registry snapshot back out of storage.
pub async fn registry_snapshot(backend: &MemoryBackend, key: &str) -> serde_json::Value {
    let bytes = backend
        .get(key)
        .await
        .unwrap()
        .unwrap_or_else(|| panic!("{key} not persisted"));
    serde_json::from_slice(&bytes).unwrap()
}
