//! The two persistent registries: sources and cache metadata.

mod cache;
mod save;
mod source;

pub(crate) use cache::{CacheRegistry, WriteDetails};
pub(crate) use source::{IngestOutcome, SourceRegistry};

use larder_core::AssetKey;

/// Storage key holding the source-registry snapshot.
pub(crate) const SOURCE_REGISTRY_KEY: &str = "assetSourceRegistry";

/// Storage key holding the cache-registry snapshot.
pub(crate) const CACHE_REGISTRY_KEY: &str = "assetCacheRegistry";

/// The asset carrying the source registry itself.
pub(crate) const ASSETS_JSON_KEY: &str = "assets.json";

/// Selects cache entries for removal or dirtying.
#[derive(Debug, Clone)]
pub enum KeyPattern {
    /// A single key.
    Exact(AssetKey),
    /// Every key matching a regular expression.
    Regex(regex::Regex),
    /// Membership in a key set.
    Any(Vec<AssetKey>),
    /// Every key.
    All,
}

impl KeyPattern {
    /// `true` when `key` is selected by this pattern.
    pub fn matches(&self, key: &AssetKey) -> bool {
        match self {
            KeyPattern::Exact(exact) => exact == key,
            KeyPattern::Regex(re) => re.is_match(key.as_str()),
            KeyPattern::Any(keys) => keys.contains(key),
            KeyPattern::All => true,
        }
    }
}

impl From<AssetKey> for KeyPattern {
    fn from(key: AssetKey) -> Self {
        KeyPattern::Exact(key)
    }
}

impl From<&str> for KeyPattern {
    fn from(key: &str) -> Self {
        KeyPattern::Exact(AssetKey::new(key))
    }
}

impl From<regex::Regex> for KeyPattern {
    fn from(re: regex::Regex) -> Self {
        KeyPattern::Regex(re)
    }
}

impl From<Vec<AssetKey>> for KeyPattern {
    fn from(keys: Vec<AssetKey>) -> Self {
        KeyPattern::Any(keys)
    }
}
