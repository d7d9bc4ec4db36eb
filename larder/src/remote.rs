//! Unconditional remote refresh with origin-time reconciliation.

use rand::seq::SliceRandom;
use tracing::{debug, warn};

use larder_core::{AssetKey, AssetKind, CacheEntryPatch, parse_list_header};

use crate::error::AssetError;
use crate::hub::{AssetContent, AssetHub};
use crate::registry::{ASSETS_JSON_KEY, WriteDetails};

impl AssetHub {
    /// Refetches a registered asset from its remote URLs, honouring
    /// staleness.
    ///
    /// CDN mirrors are shuffled to spread load, and prepended in
    /// remote-server-friendly mode (background cycles) or appended
    /// otherwise. A fetched copy whose origin time predates the cached
    /// copy's is rejected; if every candidate is rejected that way, the
    /// cached content stands and only its update clock moves.
    pub async fn get_remote(&self, key: impl Into<AssetKey>) -> AssetContent {
        let key = key.into();
        let descriptor = match self.inner.sources.get(&key).await {
            Ok(Some(descriptor)) => descriptor,
            Ok(None) => return AssetContent::failure(key, AssetError::NotFound),
            Err(error) => return AssetContent::failure(key, error),
        };
        let cached = match self.inner.cache.get(&key).await {
            Ok(entry) => entry.unwrap_or_default(),
            Err(error) => return AssetContent::failure(key, error),
        };

        let mut urls: Vec<String> = descriptor.content_urls.clone();
        if !descriptor.cdn_urls.is_empty() {
            let mut mirrors = descriptor.cdn_urls.clone();
            mirrors.shuffle(&mut rand::rng());
            if self.inner.fetcher.remote_server_friendly() {
                mirrors.extend(urls);
                urls = mirrors;
            } else {
                urls.extend(mirrors);
            }
        }
        if key.as_str() == ASSETS_JSON_KEY {
            // Dev vs. release build selection for the registry asset.
            for url in &mut urls {
                if url.ends_with("/assets/assets.json") {
                    *url = self.inner.config.default_registry_path.clone();
                }
            }
        }

        let mut last_error: Option<AssetError> = None;
        let mut stale_seen = false;
        for url in urls {
            let result = self.fetch_by_kind(&url, descriptor.kind).await;
            if !result.is_usable() {
                let error = if result.status.is_none() {
                    AssetError::Network
                } else {
                    result.error.unwrap_or(AssetError::NotFound)
                };
                warn!(%key, %url, %error, "refresh candidate failed");
                last_error = Some(error);
                continue;
            }

            if result.resource_time > 0
                && cached.resource_time > 0
                && result.resource_time < cached.resource_time
            {
                debug!(%key, %url, "remote copy is older than cached copy, skipping");
                stale_seen = true;
                continue;
            }

            if let Err(error) = self
                .inner
                .cache
                .write(
                    &key,
                    &result.content,
                    WriteDetails {
                        resource_time: result.resource_time,
                        url: Some(url.clone()),
                        silent: false,
                    },
                )
                .await
            {
                return AssetContent::failure(key, error);
            }
            if descriptor.kind == AssetKind::Filters {
                let header = parse_list_header(&result.content);
                if let Err(error) = self
                    .inner
                    .cache
                    .set_details(
                        &key,
                        CacheEntryPatch::default()
                            .expires(header.expires_days)
                            .diff_expires(header.diff_expires_days)
                            .diff_name(header.diff_name)
                            .diff_path(header.diff_path),
                    )
                    .await
                {
                    warn!(%key, %error, "failed to store list header details");
                }
            }
            if let Err(error) = self.inner.sources.note_success(&key).await {
                warn!(%key, %error, "failed to clear source error state");
            }

            return AssetContent {
                key,
                content: result.content,
                source_url: Some(url),
                error: None,
            };
        }

        if stale_seen {
            // Every reachable copy predates the cache. Leave the content
            // alone and push the update clock to the cached origin time.
            if let Err(error) = self
                .inner
                .cache
                .set_details(
                    &key,
                    CacheEntryPatch::default().write_time(cached.resource_time),
                )
                .await
            {
                warn!(%key, %error, "failed to reset update clock");
            }
            return AssetContent {
                key,
                content: String::new(),
                source_url: None,
                error: None,
            };
        }

        let error = last_error.unwrap_or(AssetError::NotFound);
        if let Err(record_error) = self
            .inner
            .sources
            .set_last_error(&key, error.to_string())
            .await
        {
            warn!(%key, %record_error, "failed to record source error");
        }
        AssetContent::failure(key, AssetError::NotFound)
    }
}
