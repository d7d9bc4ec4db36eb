//! Source descriptors: where an asset comes from and how often it refreshes.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::key::is_remote_url;
use crate::now_ms;
use crate::patch::Patch;

/// Asset type tag; `Filters` selects list assembly on fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    /// A filter list; fetching inlines `!#include` sublists.
    Filters,
    /// Any other text asset, fetched verbatim.
    #[default]
    Internal,
}

impl<'de> Deserialize<'de> for AssetKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Unrecognized tags are tolerated so newer registry payloads keep
        // deserializing.
        let tag = String::deserialize(deserializer)?;
        Ok(match tag.as_str() {
            "filters" => AssetKind::Filters,
            _ => AssetKind::Internal,
        })
    }
}

/// The last failure recorded against a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastError {
    /// When the failure happened, epoch milliseconds.
    pub time: i64,
    /// Observable error code or message.
    pub error: String,
}

/// Where an asset is fetched from, and ancillary status.
///
/// Serialization round-trips the `assets.json` wire schema: camelCase names,
/// `content` as the kind tag, and `contentURL` accepting either a scalar or a
/// sequence (anything else normalizes to the empty sequence).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SourceDescriptor {
    /// Ordered fetch candidates.
    #[serde(
        rename = "contentURL",
        deserialize_with = "urls_lenient",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub content_urls: Vec<String>,
    /// Optional ordered mirror URLs.
    #[serde(
        rename = "cdnURLs",
        deserialize_with = "urls_lenient",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub cdn_urls: Vec<String>,
    /// Asset type tag.
    #[serde(rename = "content")]
    pub kind: AssetKind,
    /// Human-readable list title.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Grouping label used by consumers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Free-form space-separated tags.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
    /// Upstream support page.
    #[serde(rename = "supportURL", skip_serializing_if = "Option::is_none")]
    pub support_url: Option<String>,
    /// Default refresh TTL in days; cache-entry TTLs take precedence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_after: Option<f64>,
    /// Derived: some content URL is not an external URL.
    #[serde(rename = "hasLocalURL")]
    pub has_local_url: bool,
    /// Derived: some content URL is an external URL.
    #[serde(rename = "hasRemoteURL")]
    pub has_remote_url: bool,
    /// Disabled by default in the default listset.
    pub off: bool,
    /// Registered at runtime rather than shipped in `assets.json`.
    pub external: bool,
    /// Who submitted this source, when not built-in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submitter: Option<String>,
    /// Refreshed on every registration carrying a submitter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submit_time: Option<i64>,
    /// Last fetch failure, cleared on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
    /// When the asset first appeared, for externally added sources.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub birthtime: Option<i64>,
    /// Keys enabled by default; maintained on the `assets.json` entry only.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub default_listset: Vec<String>,
}

impl SourceDescriptor {
    /// Recomputes the derived `has_local_url`/`has_remote_url` flags.
    pub fn refresh_url_flags(&mut self) {
        self.has_local_url = self.content_urls.iter().any(|u| !is_remote_url(u));
        self.has_remote_url = self.content_urls.iter().any(|u| is_remote_url(u));
    }

    /// All fetch candidates in order: content URLs, then CDN mirrors.
    pub fn urls(&self) -> impl Iterator<Item = &str> {
        self.content_urls
            .iter()
            .chain(self.cdn_urls.iter())
            .map(String::as_str)
    }

    /// Merges a patch into this descriptor.
    ///
    /// Derived URL flags are recomputed, and a patch carrying a submitter
    /// stamps `submit_time` with the current time.
    pub fn merge(&mut self, patch: SourcePatch) {
        let stamped = matches!(patch.submitter, Patch::Set(_));
        patch.content_urls.apply_value(&mut self.content_urls);
        patch.cdn_urls.apply_value(&mut self.cdn_urls);
        patch.kind.apply_value(&mut self.kind);
        patch.title.apply(&mut self.title);
        patch.group.apply(&mut self.group);
        patch.tags.apply(&mut self.tags);
        patch.support_url.apply(&mut self.support_url);
        patch.update_after.apply(&mut self.update_after);
        patch.off.apply_value(&mut self.off);
        patch.external.apply_value(&mut self.external);
        patch.submitter.apply(&mut self.submitter);
        patch.last_error.apply(&mut self.last_error);
        patch.birthtime.apply(&mut self.birthtime);
        patch.default_listset.apply_value(&mut self.default_listset);
        self.refresh_url_flags();
        if stamped {
            self.submit_time = Some(now_ms());
        }
    }
}

/// Field-by-field merge into a [`SourceDescriptor`].
///
/// Deserializes from the same wire schema as the descriptor itself, with
/// missing fields mapping to [`Patch::Keep`] and `null` to [`Patch::Clear`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SourcePatch {
    /// Ordered fetch candidates.
    #[serde(rename = "contentURL", deserialize_with = "patch_urls")]
    pub content_urls: Patch<Vec<String>>,
    /// Optional ordered mirror URLs.
    #[serde(rename = "cdnURLs", deserialize_with = "patch_urls")]
    pub cdn_urls: Patch<Vec<String>>,
    /// Asset type tag.
    #[serde(rename = "content")]
    pub kind: Patch<AssetKind>,
    /// Human-readable list title.
    pub title: Patch<String>,
    /// Grouping label used by consumers.
    pub group: Patch<String>,
    /// Free-form space-separated tags.
    pub tags: Patch<String>,
    /// Upstream support page.
    #[serde(rename = "supportURL")]
    pub support_url: Patch<String>,
    /// Default refresh TTL in days.
    pub update_after: Patch<f64>,
    /// Disabled by default in the default listset.
    pub off: Patch<bool>,
    /// Registered at runtime rather than shipped in `assets.json`.
    pub external: Patch<bool>,
    /// Who submitted this source.
    pub submitter: Patch<String>,
    /// Last fetch failure.
    pub last_error: Patch<LastError>,
    /// When the asset first appeared.
    pub birthtime: Patch<i64>,
    /// Keys enabled by default.
    pub default_listset: Patch<Vec<String>>,
}

impl SourcePatch {
    /// Sets the ordered fetch candidates.
    pub fn content_urls<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.content_urls = Patch::Set(urls.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the CDN mirror URLs.
    pub fn cdn_urls<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cdn_urls = Patch::Set(urls.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the asset type tag.
    pub fn kind(mut self, kind: AssetKind) -> Self {
        self.kind = Patch::Set(kind);
        self
    }

    /// Sets the default refresh TTL in days.
    pub fn update_after(mut self, days: f64) -> Self {
        self.update_after = Patch::Set(days);
        self
    }

    /// Marks the source as externally registered.
    pub fn external(mut self, external: bool) -> Self {
        self.external = Patch::Set(external);
        self
    }

    /// Records the submitter; merging will stamp the submit time.
    pub fn submitter(mut self, submitter: impl Into<String>) -> Self {
        self.submitter = Patch::Set(submitter.into());
        self
    }
}

pub(crate) fn normalize_urls(value: &Value) -> Vec<String> {
    match value {
        Value::String(url) => vec![url.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

fn urls_lenient<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(normalize_urls(&value))
}

fn patch_urls<'de, D>(deserializer: D) -> Result<Patch<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Null => Patch::Clear,
        other => Patch::Set(normalize_urls(&other)),
    })
}
