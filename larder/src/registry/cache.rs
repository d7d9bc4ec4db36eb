//! The cache registry: asset key → cache metadata, plus the content blobs.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, warn};

use larder_backend::Storage;
use larder_core::{AssetKey, CacheEntry, CacheEntryPatch, Event, EventBus, now_ms};

use crate::config::EngineConfig;
use crate::error::AssetError;
use crate::hub::AssetContent;
use crate::registry::save::DebouncedSaver;
use crate::registry::{CACHE_REGISTRY_KEY, KeyPattern};

type CacheMap = HashMap<AssetKey, CacheEntry>;

/// Parameters accompanying a cache write.
#[derive(Debug, Default)]
pub(crate) struct WriteDetails {
    /// Origin timestamp of the content, `0` when unknown.
    pub resource_time: i64,
    /// The URL the content was actually fetched from.
    pub url: Option<String>,
    /// Suppress the change notification.
    pub silent: bool,
}

/// Persistent map of cache metadata; content blobs live at `cache/<key>`.
#[derive(Clone)]
pub(crate) struct CacheRegistry {
    inner: Arc<CacheRegistryInner>,
}

struct CacheRegistryInner {
    storage: Arc<dyn Storage>,
    config: Arc<EngineConfig>,
    events: EventBus,
    cell: OnceCell<RwLock<CacheMap>>,
    saver: DebouncedSaver,
    /// Construction time; entries unread since then are eviction candidates.
    start_time: i64,
}

impl CacheRegistry {
    pub(crate) fn new(
        storage: Arc<dyn Storage>,
        config: Arc<EngineConfig>,
        events: EventBus,
    ) -> Self {
        CacheRegistry {
            inner: Arc::new(CacheRegistryInner {
                storage,
                config,
                events,
                cell: OnceCell::new(),
                saver: DebouncedSaver::default(),
                start_time: now_ms(),
            }),
        }
    }

    /// When this registry instance came up.
    pub(crate) fn start_time(&self) -> i64 {
        self.inner.start_time
    }

    async fn map(&self) -> Result<&RwLock<CacheMap>, AssetError> {
        self.inner
            .cell
            .get_or_try_init(|| async {
                let map = match self.inner.storage.get(CACHE_REGISTRY_KEY).await? {
                    Some(bytes) => match serde_json::from_slice::<CacheMap>(&bytes) {
                        Ok(map) => map,
                        Err(error) => {
                            warn!(%error, "persisted cache registry is unreadable, starting empty");
                            CacheMap::new()
                        }
                    },
                    None => CacheMap::new(),
                };
                Ok(RwLock::new(map))
            })
            .await
    }

    /// Reads the content blob for `key`.
    ///
    /// A missing blob reads as not found; a binary blob reads as empty
    /// content. With `update_read_time`, a hit stamps the entry's read time
    /// and lazily persists the registry. Transient keys are exempt, since
    /// they would otherwise force a registry write on every launch.
    pub(crate) async fn read(&self, key: &AssetKey, update_read_time: bool) -> AssetContent {
        let blob = match self.inner.storage.get(&key.blob_key()).await {
            Ok(blob) => blob,
            Err(error) => return AssetContent::failure(key.clone(), error.into()),
        };
        let Some(blob) = blob else {
            return AssetContent::failure(key.clone(), AssetError::NotFound);
        };
        let content = match String::from_utf8(blob.to_vec()) {
            Ok(content) => content,
            Err(_) => String::new(),
        };

        if update_read_time && !key.is_transient() {
            match self.map().await {
                Ok(lock) => {
                    let stamped = {
                        let mut map = lock.write().await;
                        match map.get_mut(key) {
                            Some(entry) => {
                                // Strictly advance even within one millisecond.
                                entry.read_time = now_ms().max(entry.read_time + 1);
                                true
                            }
                            None => false,
                        }
                    };
                    if stamped {
                        self.schedule_save();
                    }
                }
                Err(error) => warn!(%key, %error, "cache registry unavailable"),
            }
        }

        AssetContent {
            key: key.clone(),
            content,
            source_url: None,
            error: None,
        }
    }

    /// Writes content for `key`, stamping write/read/resource times.
    ///
    /// Empty content is a removal.
    pub(crate) async fn write(
        &self,
        key: &AssetKey,
        content: &str,
        details: WriteDetails,
    ) -> Result<(), AssetError> {
        if content.is_empty() {
            self.remove(&KeyPattern::Exact(key.clone()), details.silent)
                .await?;
            return Ok(());
        }

        let lock = self.map().await?;
        {
            let mut map = lock.write().await;
            let entry = map.entry(key.clone()).or_default();
            let now = now_ms();
            entry.write_time = now;
            entry.read_time = now;
            entry.resource_time = details.resource_time;
            if let Some(url) = details.url {
                entry.remote_url = Some(url);
            }
        }
        self.inner
            .storage
            .set(vec![(key.blob_key(), Bytes::from(content.to_owned()))])
            .await?;
        self.schedule_save();

        if !details.silent {
            self.inner
                .events
                .emit(Event::AssetUpdated { key: key.clone() });
        }
        Ok(())
    }

    /// Drops every entry matching `pattern`, along with its content blob.
    pub(crate) async fn remove(
        &self,
        pattern: &KeyPattern,
        silent: bool,
    ) -> Result<Vec<AssetKey>, AssetError> {
        let lock = self.map().await?;
        let removed: Vec<AssetKey> = {
            let mut map = lock.write().await;
            let keys: Vec<AssetKey> = map
                .keys()
                .filter(|key| pattern.matches(key))
                .cloned()
                .collect();
            for key in &keys {
                map.remove(key);
            }
            keys
        };
        if removed.is_empty() {
            return Ok(removed);
        }

        let blob_keys: Vec<String> = removed.iter().map(AssetKey::blob_key).collect();
        self.inner.storage.remove(&blob_keys).await?;
        self.schedule_save();

        if !silent {
            for key in &removed {
                debug!(%key, "cached asset removed");
                self.inner
                    .events
                    .emit(Event::AssetUpdated { key: key.clone() });
            }
        }
        Ok(removed)
    }

    /// Merges a metadata patch; persists lazily only when something changed.
    pub(crate) async fn set_details(
        &self,
        key: &AssetKey,
        patch: CacheEntryPatch,
    ) -> Result<(), AssetError> {
        let lock = self.map().await?;
        let changed = {
            let mut map = lock.write().await;
            match map.get_mut(key) {
                Some(entry) => entry.merge(patch),
                None => false,
            }
        };
        if changed {
            self.schedule_save();
        }
        Ok(())
    }

    /// Zeroes `write_time` for matching entries so the next update cycle
    /// treats them as obsolete. Content is left in place.
    pub(crate) async fn mark_dirty(
        &self,
        pattern: &KeyPattern,
        exclude: Option<&KeyPattern>,
    ) -> Result<(), AssetError> {
        let lock = self.map().await?;
        let changed = {
            let mut map = lock.write().await;
            let mut changed = false;
            for (key, entry) in map.iter_mut() {
                if !pattern.matches(key) {
                    continue;
                }
                if let Some(exclude) = exclude
                    && exclude.matches(key)
                {
                    continue;
                }
                if entry.write_time != 0 {
                    entry.write_time = 0;
                    changed = true;
                }
            }
            changed
        };
        if changed {
            self.schedule_save();
        }
        Ok(())
    }

    pub(crate) async fn get(&self, key: &AssetKey) -> Result<Option<CacheEntry>, AssetError> {
        let lock = self.map().await?;
        Ok(lock.read().await.get(key).cloned())
    }

    pub(crate) async fn snapshot(&self) -> Result<CacheMap, AssetError> {
        let lock = self.map().await?;
        Ok(lock.read().await.clone())
    }

    fn schedule_save(&self) {
        let inner = self.inner.clone();
        self.inner
            .saver
            .schedule(self.inner.config.cache_save_delay, move || async move {
                if let Some(lock) = inner.cell.get() {
                    let snapshot = lock.read().await.clone();
                    inner.save(&snapshot).await;
                }
            });
    }

    /// Persists the current snapshot immediately.
    pub(crate) async fn save_now(&self) {
        self.inner.saver.cancel();
        if let Some(lock) = self.inner.cell.get() {
            let snapshot = lock.read().await.clone();
            self.inner.save(&snapshot).await;
        }
    }

}

impl CacheRegistryInner {
    async fn save(&self, map: &CacheMap) {
        let bytes = match serde_json::to_vec(map) {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(%error, "cache registry snapshot failed to serialize");
                return;
            }
        };
        if let Err(error) = self
            .storage
            .set(vec![(CACHE_REGISTRY_KEY.to_string(), Bytes::from(bytes))])
            .await
        {
            warn!(%error, "failed to persist cache registry");
        }
    }
}
