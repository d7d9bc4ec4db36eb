//! Asset key type and URL classification.

use std::borrow::Borrow;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

static RE_REMOTE_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[a-z-]+://").expect("valid remote-url pattern"));

/// Returns `true` when the string is an external URL (scheme-prefixed).
///
/// Anything else is resolved against the local asset root.
pub fn is_remote_url(url: &str) -> bool {
    RE_REMOTE_URL.is_match(url)
}

/// Stable logical identifier of an asset.
///
/// Keys are opaque strings; a few prefixes carry meaning:
///
/// - `user-`: a user asset, lives in settings storage and is never cached;
/// - `compiled/`, `selfie/`: transient artifacts, reads skip read-time
///   tracking to avoid launch-time registry writes;
/// - a full URL: ad-hoc external asset without a registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetKey(SmolStr);

impl AssetKey {
    /// Wraps a string as an asset key.
    pub fn new(key: impl AsRef<str>) -> Self {
        AssetKey(SmolStr::new(key.as_ref()))
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// `true` for user assets (`user-` prefix).
    pub fn is_user(&self) -> bool {
        self.0.starts_with("user-")
    }

    /// `true` when the key itself is an external URL.
    pub fn is_url(&self) -> bool {
        is_remote_url(&self.0)
    }

    /// `true` for transient artifacts (`compiled/`, `selfie/`).
    pub fn is_transient(&self) -> bool {
        self.0.starts_with("compiled/") || self.0.starts_with("selfie/")
    }

    /// Storage key of the content blob backing this asset.
    pub fn blob_key(&self) -> String {
        format!("cache/{}", self.0)
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AssetKey {
    fn from(key: &str) -> Self {
        AssetKey::new(key)
    }
}

impl From<String> for AssetKey {
    fn from(key: String) -> Self {
        AssetKey(SmolStr::from(key))
    }
}

impl AsRef<str> for AssetKey {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Borrow<str> for AssetKey {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}
