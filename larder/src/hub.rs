//! The engine facade: cache-first reads, user assets, registry maintenance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, broadcast};
use tracing::warn;

use larder_backend::{MemoryBackend, MemorySettings, SettingsStore, Storage};
use larder_core::{
    AssetKey, AssetKind, Event, EventBus, KeepPolicies, PolicyId, SourceDescriptor, SourcePatch,
    UpdateKeepPolicy, days_to_ms, is_remote_url, now_ms,
};

use crate::assemble::{ListAssembler, PassthroughPreparser, Preparser};
use crate::config::EngineConfig;
use crate::diff::PatchWorkerSpawner;
use crate::error::AssetError;
use crate::fetch::{HttpFetcher, TextFetcher};
use crate::registry::{CacheRegistry, KeyPattern, SourceRegistry, WriteDetails};
use crate::updater::UpdaterState;

/// What a read or fetch operation hands back.
///
/// Failures are carried in-band: `content` is empty and `error` is set.
#[derive(Debug)]
pub struct AssetContent {
    /// The asset key that was asked for.
    pub key: AssetKey,
    /// The asset's text content, empty on failure.
    pub content: String,
    /// The URL the content came from, when requested via
    /// [`GetOptions::need_source_url`].
    pub source_url: Option<String>,
    /// What went wrong, when anything did.
    pub error: Option<AssetError>,
}

impl AssetContent {
    pub(crate) fn failure(key: AssetKey, error: AssetError) -> Self {
        AssetContent {
            key,
            content: String::new(),
            source_url: None,
            error: Some(error),
        }
    }

    /// `true` when the operation produced usable content.
    pub fn is_usable(&self) -> bool {
        self.error.is_none() && !self.content.is_empty()
    }
}

/// Options for [`AssetHub::get_with`].
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Report the URL the content was read or fetched from.
    pub need_source_url: bool,
    /// Do not write fetched content back to the cache.
    pub dont_cache: bool,
    /// Suppress change notifications for any cache write this read causes.
    pub silent: bool,
}

/// A source descriptor merged with its cache state.
#[derive(Debug, Clone)]
pub struct AssetMetadata {
    /// The registered source descriptor.
    pub source: SourceDescriptor,
    /// Epoch ms of the last successful cache write, `0` if never written.
    pub write_time: i64,
    /// Origin timestamp of the cached content.
    pub resource_time: i64,
    /// The URL the cached content was fetched from.
    pub remote_url: Option<String>,
    /// `true` when the cached copy is older than its refresh TTL.
    pub obsolete: bool,
}

/// Builder for [`AssetHub`].
pub struct AssetHubBuilder {
    config: EngineConfig,
    storage: Option<Arc<dyn Storage>>,
    settings: Option<Arc<dyn SettingsStore>>,
    fetcher: Option<Arc<dyn TextFetcher>>,
    preparser: Option<Arc<dyn Preparser>>,
    patch_worker: Option<Arc<dyn PatchWorkerSpawner>>,
}

impl AssetHubBuilder {
    /// Starts a builder with default configuration.
    pub fn new() -> Self {
        AssetHubBuilder {
            config: EngineConfig::default(),
            storage: None,
            settings: None,
            fetcher: None,
            preparser: None,
            patch_worker: None,
        }
    }

    /// Sets the engine configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the blob store backing registries and cached content.
    pub fn storage(mut self, storage: impl Storage + 'static) -> Self {
        self.storage = Some(Arc::new(storage));
        self
    }

    /// Sets the settings store backing user assets.
    pub fn settings(mut self, settings: impl SettingsStore + 'static) -> Self {
        self.settings = Some(Arc::new(settings));
        self
    }

    /// Replaces the HTTP fetcher, e.g. with a test double.
    pub fn fetcher(mut self, fetcher: impl TextFetcher + 'static) -> Self {
        self.fetcher = Some(Arc::new(fetcher));
        self
    }

    /// Sets the preparser consulted for `!#if` scoping during assembly.
    pub fn preparser(mut self, preparser: impl Preparser + 'static) -> Self {
        self.preparser = Some(Arc::new(preparser));
        self
    }

    /// Enables differential updates through the given worker spawner.
    pub fn patch_worker(mut self, spawner: impl PatchWorkerSpawner + 'static) -> Self {
        self.patch_worker = Some(Arc::new(spawner));
        self
    }

    /// Builds the hub. Missing collaborators fall back to in-memory
    /// storage/settings and the reqwest fetcher.
    pub fn build(self) -> AssetHub {
        let config = Arc::new(self.config);
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryBackend::new()));
        let settings = self
            .settings
            .unwrap_or_else(|| Arc::new(MemorySettings::new()));
        let fetcher = self
            .fetcher
            .unwrap_or_else(|| Arc::new(HttpFetcher::new(config.clone())));
        let preparser = self
            .preparser
            .unwrap_or_else(|| Arc::new(PassthroughPreparser));
        let events = EventBus::default();

        let sources = SourceRegistry::new(
            storage.clone(),
            config.clone(),
            events.clone(),
            fetcher.clone(),
        );
        let cache = CacheRegistry::new(storage, config.clone(), events.clone());

        AssetHub {
            inner: Arc::new(HubInner {
                updater: Mutex::new(UpdaterState::new(config.update_delay)),
                update_nudge: Notify::new(),
                config,
                settings,
                fetcher,
                preparser,
                events,
                keep_policies: KeepPolicies::default(),
                sources,
                cache,
                patch_worker: self.patch_worker,
            }),
        }
    }
}

impl Default for AssetHubBuilder {
    fn default() -> Self {
        AssetHubBuilder::new()
    }
}

pub(crate) struct HubInner {
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) settings: Arc<dyn SettingsStore>,
    pub(crate) fetcher: Arc<dyn TextFetcher>,
    pub(crate) preparser: Arc<dyn Preparser>,
    pub(crate) events: EventBus,
    pub(crate) keep_policies: KeepPolicies,
    pub(crate) sources: SourceRegistry,
    pub(crate) cache: CacheRegistry,
    pub(crate) updater: Mutex<UpdaterState>,
    pub(crate) update_nudge: Notify,
    pub(crate) patch_worker: Option<Arc<dyn PatchWorkerSpawner>>,
}

/// The asset engine: acquisition, caching, and scheduled refresh.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct AssetHub {
    pub(crate) inner: Arc<HubInner>,
}

impl AssetHub {
    /// Starts building a hub.
    pub fn builder() -> AssetHubBuilder {
        AssetHubBuilder::new()
    }

    /// Reads an asset, cache first, falling back to its source URLs.
    pub async fn get(&self, key: impl Into<AssetKey>) -> AssetContent {
        self.get_with(key, GetOptions::default()).await
    }

    /// [`get`](Self::get) with options.
    ///
    /// User assets delegate to settings storage. Otherwise the cache is
    /// consulted first; on a miss, source URLs are tried in order (content
    /// URLs then CDN mirrors), external URLs are skipped while a local
    /// alternative exists, and the first non-empty result wins. External
    /// results are written back to the cache unless `dont_cache`.
    pub async fn get_with(&self, key: impl Into<AssetKey>, options: GetOptions) -> AssetContent {
        let key = key.into();
        if key.is_user() {
            return self.read_user_asset(key).await;
        }

        let cached = self.inner.cache.read(&key, true).await;
        if cached.is_usable() {
            let source_url = if options.need_source_url {
                match self.inner.cache.get(&key).await {
                    Ok(entry) => entry.and_then(|e| e.remote_url),
                    Err(_) => None,
                }
            } else {
                None
            };
            return AssetContent {
                source_url,
                ..cached
            };
        }

        let descriptor = match self.inner.sources.get(&key).await {
            Ok(descriptor) => descriptor,
            Err(error) => return AssetContent::failure(key, error),
        };
        let (urls, kind, has_local_url, registered) = match &descriptor {
            Some(descriptor) => (
                descriptor.urls().map(String::from).collect::<Vec<_>>(),
                descriptor.kind,
                descriptor.has_local_url,
                true,
            ),
            None if key.is_url() => (
                vec![key.as_str().to_string()],
                AssetKind::Filters,
                false,
                false,
            ),
            None => return AssetContent::failure(key, AssetError::NotFound),
        };

        let mut last_error: Option<AssetError> = None;
        for url in urls {
            if is_remote_url(&url) && has_local_url {
                continue;
            }
            let fetched = self.fetch_by_kind(&url, kind).await;
            if !fetched.is_usable() {
                if let Some(error) = fetched.error {
                    last_error = Some(error);
                }
                continue;
            }

            if is_remote_url(&url) && !options.dont_cache {
                if let Err(error) = self
                    .inner
                    .cache
                    .write(
                        &key,
                        &fetched.content,
                        WriteDetails {
                            resource_time: fetched.resource_time,
                            url: Some(url.clone()),
                            silent: options.silent,
                        },
                    )
                    .await
                {
                    warn!(%key, %error, "failed to cache fetched asset");
                }
                if registered && let Err(error) = self.inner.sources.note_success(&key).await {
                    warn!(%key, %error, "failed to clear source error state");
                }
            }

            return AssetContent {
                key,
                content: fetched.content,
                source_url: options.need_source_url.then_some(url),
                error: None,
            };
        }

        let error = last_error.unwrap_or(AssetError::NotFound);
        if registered
            && let Err(record_error) = self
                .inner
                .sources
                .set_last_error(&key, error.to_string())
                .await
        {
            warn!(%key, %record_error, "failed to record source error");
        }
        AssetContent::failure(key, error)
    }

    pub(crate) async fn fetch_by_kind(
        &self,
        url: &str,
        kind: AssetKind,
    ) -> crate::fetch::FetchedText {
        match kind {
            AssetKind::Filters => {
                ListAssembler::new(&*self.inner.fetcher, &*self.inner.preparser)
                    .assemble(url)
                    .await
            }
            AssetKind::Internal => self.inner.fetcher.fetch_text(url).await,
        }
    }

    async fn read_user_asset(&self, key: AssetKey) -> AssetContent {
        match self.inner.settings.read(key.as_str()).await {
            Ok(Some(content)) => AssetContent {
                key,
                content,
                source_url: None,
                error: None,
            },
            Ok(None) => AssetContent::failure(key, AssetError::NotFound),
            Err(error) => AssetContent::failure(key, error.into()),
        }
    }

    /// Writes an asset: user assets to settings storage, anything else to
    /// the cache store.
    pub async fn put(&self, key: impl Into<AssetKey>, content: &str) -> Result<(), AssetError> {
        let key = key.into();
        if key.is_user() {
            self.inner
                .settings
                .write(key.as_str(), content.to_owned())
                .await?;
            return Ok(());
        }
        self.inner
            .cache
            .write(&key, content, WriteDetails::default())
            .await
    }

    /// The merged view over both registries.
    pub async fn metadata(&self) -> Result<HashMap<AssetKey, AssetMetadata>, AssetError> {
        let sources = self.inner.sources.snapshot().await?;
        let cache = self.inner.cache.snapshot().await?;
        let now = now_ms();

        let mut merged = HashMap::with_capacity(sources.len());
        for (key, source) in sources {
            let entry = cache.get(&key).cloned().unwrap_or_default();
            let ttl = entry
                .ttl_days(source.update_after)
                .unwrap_or(self.inner.config.default_update_after_days);
            let obsolete =
                source.has_remote_url && entry.write_time + days_to_ms(ttl) <= now;
            merged.insert(
                key,
                AssetMetadata {
                    source,
                    write_time: entry.write_time,
                    resource_time: entry.resource_time,
                    remote_url: entry.remote_url,
                    obsolete,
                },
            );
        }
        Ok(merged)
    }

    /// Registers or amends a source descriptor.
    pub async fn register_source(
        &self,
        key: impl Into<AssetKey>,
        patch: SourcePatch,
    ) -> Result<(), AssetError> {
        self.inner.sources.register(&key.into(), patch).await
    }

    /// Drops a source along with its cache entry and content blob.
    pub async fn unregister_source(&self, key: impl Into<AssetKey>) -> Result<(), AssetError> {
        let key = key.into();
        self.inner.sources.unregister(&key).await?;
        self.inner
            .cache
            .remove(&KeyPattern::Exact(key), false)
            .await?;
        Ok(())
    }

    /// Reingests the source registry from an `assets.json` payload.
    ///
    /// Built-in sources absent from the payload are unregistered, cached
    /// content included.
    pub async fn update_source_registry(
        &self,
        json: &str,
        silent: bool,
    ) -> Result<(), AssetError> {
        if let Some(outcome) = self.inner.sources.update_from_json(json, silent).await? {
            for key in outcome.removed {
                self.inner
                    .cache
                    .remove(&KeyPattern::Exact(key), false)
                    .await?;
            }
        }
        Ok(())
    }

    /// Drops cached content matching `pattern`.
    pub async fn remove(&self, pattern: impl Into<KeyPattern>) -> Result<(), AssetError> {
        self.inner.cache.remove(&pattern.into(), false).await?;
        Ok(())
    }

    /// Drops every cached entry and blob.
    pub async fn rmrf(&self) -> Result<(), AssetError> {
        self.inner.cache.remove(&KeyPattern::All, false).await?;
        Ok(())
    }

    /// Marks matching cache entries as needing refresh without dropping
    /// their content.
    pub async fn mark_dirty(
        &self,
        pattern: impl Into<KeyPattern>,
        exclude: Option<KeyPattern>,
    ) -> Result<(), AssetError> {
        self.inner
            .cache
            .mark_dirty(&pattern.into(), exclude.as_ref())
            .await
    }

    /// Subscribes to engine events.
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    /// Registers an update-keep policy hook.
    pub fn add_keep_policy(&self, policy: Arc<dyn UpdateKeepPolicy>) -> PolicyId {
        self.inner.keep_policies.add(policy)
    }

    /// Removes a previously registered keep policy.
    pub fn remove_keep_policy(&self, id: PolicyId) -> bool {
        self.inner.keep_policies.remove(id)
    }

    /// Persists both registries immediately, cancelling pending debounced
    /// saves. Call on shutdown.
    pub async fn flush(&self) {
        self.inner.sources.save_now().await;
        self.inner.cache.save_now().await;
    }
}
