//! The source registry: asset key → where to fetch it and how often.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, warn};

use larder_backend::Storage;
use larder_core::{
    AssetKey, Event, EventBus, LastError, SourceDescriptor, SourcePatch, now_ms,
};

use crate::config::EngineConfig;
use crate::error::AssetError;
use crate::fetch::TextFetcher;
use crate::registry::save::DebouncedSaver;
use crate::registry::{ASSETS_JSON_KEY, SOURCE_REGISTRY_KEY};

type SourceMap = HashMap<AssetKey, SourceDescriptor>;

/// What changed when an `assets.json` payload was ingested.
pub(crate) struct IngestOutcome {
    /// Keys that were not registered before.
    pub added: Vec<AssetKey>,
    /// Built-in keys dropped by the new payload; their cached content must
    /// be purged by the caller.
    pub removed: Vec<AssetKey>,
}

/// Persistent map of source descriptors, lazily loaded and bootstrapped on
/// first run.
#[derive(Clone)]
pub(crate) struct SourceRegistry {
    inner: Arc<SourceRegistryInner>,
}

struct SourceRegistryInner {
    storage: Arc<dyn Storage>,
    config: Arc<EngineConfig>,
    events: EventBus,
    fetcher: Arc<dyn TextFetcher>,
    cell: OnceCell<RwLock<SourceMap>>,
    saver: DebouncedSaver,
}

impl SourceRegistry {
    pub(crate) fn new(
        storage: Arc<dyn Storage>,
        config: Arc<EngineConfig>,
        events: EventBus,
        fetcher: Arc<dyn TextFetcher>,
    ) -> Self {
        SourceRegistry {
            inner: Arc::new(SourceRegistryInner {
                storage,
                config,
                events,
                fetcher,
                cell: OnceCell::new(),
                saver: DebouncedSaver::default(),
            }),
        }
    }

    /// The registry map, loading and bootstrapping on first access.
    ///
    /// Initialization is single-flight: concurrent callers await the same
    /// load instead of racing to overwrite each other.
    async fn map(&self) -> Result<&RwLock<SourceMap>, AssetError> {
        self.inner
            .cell
            .get_or_try_init(|| async {
                if let Some(bytes) = self.inner.storage.get(SOURCE_REGISTRY_KEY).await? {
                    match serde_json::from_slice::<SourceMap>(&bytes) {
                        Ok(map) if !map.is_empty() => return Ok(RwLock::new(map)),
                        Ok(_) => {}
                        Err(error) => {
                            warn!(%error, "persisted source registry is unreadable, rebootstrapping");
                        }
                    }
                }
                Ok(RwLock::new(self.bootstrap().await))
            })
            .await
    }

    /// First-run population: the remote bootstrap location, then the
    /// bundled registry.
    async fn bootstrap(&self) -> SourceMap {
        let mut text = None;
        if !self.inner.config.bootstrap_url.is_empty() {
            let fetched = self
                .inner
                .fetcher
                .fetch_text(&self.inner.config.bootstrap_url)
                .await;
            if fetched.is_usable() {
                text = Some(fetched.content);
            }
        }
        let text = match text {
            Some(text) => text,
            None => {
                let fetched = self
                    .inner
                    .fetcher
                    .fetch_text(&self.inner.config.default_registry_path)
                    .await;
                if fetched.is_usable() {
                    fetched.content
                } else {
                    warn!("no source registry available to bootstrap from");
                    return SourceMap::new();
                }
            }
        };

        let mut map = SourceMap::new();
        match apply_assets_json(&mut map, &text) {
            Ok(_) => {
                debug!(sources = map.len(), "bootstrapped source registry");
                self.inner.events.emit(Event::SourceRegistryUpdated {
                    new: Arc::new(map.clone()),
                    old: Arc::new(SourceMap::new()),
                });
                self.inner.save(&map).await;
            }
            Err(error) => warn!(%error, "bootstrap payload is not a source registry"),
        }
        map
    }

    /// Ingests an `assets.json` payload, merging entries and dropping
    /// built-ins absent from it.
    ///
    /// Returns `Ok(None)` when the payload does not parse; the registry is
    /// left untouched in that case.
    pub(crate) async fn update_from_json(
        &self,
        json: &str,
        silent: bool,
    ) -> Result<Option<IngestOutcome>, AssetError> {
        let lock = self.map().await?;
        let (outcome, old, new) = {
            let mut map = lock.write().await;
            let old = map.clone();
            let outcome = match apply_assets_json(&mut *map, json) {
                Ok(outcome) => outcome,
                Err(error) => {
                    warn!(%error, "ignoring unparsable source registry payload");
                    return Ok(None);
                }
            };
            (outcome, old, map.clone())
        };

        self.inner.events.emit(Event::SourceRegistryUpdated {
            new: Arc::new(new),
            old: Arc::new(old),
        });
        if !silent {
            for key in &outcome.added {
                self.inner
                    .events
                    .emit(Event::BuiltinSourceAdded { key: key.clone() });
            }
        }
        self.schedule_save();
        Ok(Some(outcome))
    }

    /// Merges a patch into the descriptor for `key`, creating it if absent.
    pub(crate) async fn register(
        &self,
        key: &AssetKey,
        patch: SourcePatch,
    ) -> Result<(), AssetError> {
        let lock = self.map().await?;
        {
            let mut map = lock.write().await;
            map.entry(key.clone()).or_default().merge(patch);
        }
        self.schedule_save();
        Ok(())
    }

    /// Drops the descriptor for `key`; the caller purges cached content.
    pub(crate) async fn unregister(&self, key: &AssetKey) -> Result<bool, AssetError> {
        let lock = self.map().await?;
        let existed = lock.write().await.remove(key).is_some();
        if existed {
            self.schedule_save();
        }
        Ok(existed)
    }

    pub(crate) async fn get(&self, key: &AssetKey) -> Result<Option<SourceDescriptor>, AssetError> {
        let lock = self.map().await?;
        Ok(lock.read().await.get(key).cloned())
    }

    pub(crate) async fn snapshot(&self) -> Result<SourceMap, AssetError> {
        let lock = self.map().await?;
        Ok(lock.read().await.clone())
    }

    /// Records a fetch failure against the source.
    pub(crate) async fn set_last_error(
        &self,
        key: &AssetKey,
        error: String,
    ) -> Result<(), AssetError> {
        let lock = self.map().await?;
        {
            let mut map = lock.write().await;
            if let Some(descriptor) = map.get_mut(key) {
                descriptor.last_error = Some(LastError {
                    time: now_ms(),
                    error,
                });
            } else {
                return Ok(());
            }
        }
        self.schedule_save();
        Ok(())
    }

    /// Clears failure state after a successful fetch.
    pub(crate) async fn note_success(&self, key: &AssetKey) -> Result<(), AssetError> {
        let lock = self.map().await?;
        {
            let mut map = lock.write().await;
            match map.get_mut(key) {
                Some(descriptor)
                    if descriptor.last_error.is_some() || descriptor.birthtime.is_some() =>
                {
                    descriptor.last_error = None;
                    descriptor.birthtime = None;
                }
                _ => return Ok(()),
            }
        }
        self.schedule_save();
        Ok(())
    }

    fn schedule_save(&self) {
        let inner = self.inner.clone();
        self.inner
            .saver
            .schedule(self.inner.config.source_save_delay, move || async move {
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

impl SourceRegistryInner {
    async fn save(&self, map: &SourceMap) {
        let bytes = match serde_json::to_vec(map) {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(%error, "source registry snapshot failed to serialize");
                return;
            }
        };
        if let Err(error) = self
            .storage
            .set(vec![(SOURCE_REGISTRY_KEY.to_string(), Bytes::from(bytes))])
            .await
        {
            warn!(%error, "failed to persist source registry");
        }
    }
}

/// Merges an `assets.json` payload into `map`.
///
/// Entries merge field-by-field (`null` clears). The `assets.json` entry
/// gets its `default_listset` recomputed: keys whose value is a filter list
/// and carries no `off` marker. Built-in entries (no submitter) absent from
/// the payload are dropped.
fn apply_assets_json(
    map: &mut SourceMap,
    json: &str,
) -> Result<IngestOutcome, serde_json::Error> {
    let parsed: serde_json::Map<String, serde_json::Value> = serde_json::from_str(json)?;

    let default_listset: Vec<String> = parsed
        .iter()
        .filter(|(_, value)| {
            value.get("content").and_then(|v| v.as_str()) == Some("filters")
                && value.get("off").is_none()
        })
        .map(|(key, _)| key.clone())
        .collect();

    let mut added = Vec::new();
    for (key, value) in &parsed {
        let patch: SourcePatch = match serde_json::from_value(value.clone()) {
            Ok(patch) => patch,
            Err(error) => {
                warn!(%key, %error, "skipping malformed source entry");
                continue;
            }
        };
        let key = AssetKey::new(key);
        if !map.contains_key(&key) {
            added.push(key.clone());
        }
        map.entry(key).or_default().merge(patch);
    }

    if let Some(entry) = map.get_mut(ASSETS_JSON_KEY) {
        entry.default_listset = default_listset;
    }

    let removed: Vec<AssetKey> = map
        .iter()
        .filter(|(key, descriptor)| {
            !parsed.contains_key(key.as_str()) && descriptor.submitter.is_none()
        })
        .map(|(key, _)| key.clone())
        .collect();
    for key in &removed {
        map.remove(key);
    }

    Ok(IngestOutcome { added, removed })
}
