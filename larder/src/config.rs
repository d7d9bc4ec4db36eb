//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for fetching, persistence, and update pacing.
///
/// All durations deserialize from humantime strings (`"30s"`, `"500ms"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// No-progress fetch timeout; any delivered byte resets it.
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,

    /// Delay between full refetches within a background update cycle.
    #[serde(with = "humantime_serde")]
    pub update_delay: Duration,

    /// Delay used by manually triggered cycles; also the threshold below
    /// which a running cycle counts as manual for [`is_updating`].
    ///
    /// [`is_updating`]: crate::AssetHub::is_updating
    #[serde(with = "humantime_serde")]
    pub manual_update_delay: Duration,

    /// Debounce window for source-registry persistence.
    #[serde(with = "humantime_serde")]
    pub source_save_delay: Duration,

    /// Debounce window for cache-registry persistence.
    #[serde(with = "humantime_serde")]
    pub cache_save_delay: Duration,

    /// Remote location the source registry bootstraps from on first run.
    /// Empty disables remote bootstrap.
    pub bootstrap_url: String,

    /// Local path of the bundled source registry; the bootstrap fallback,
    /// and the rewrite target for `…/assets/assets.json` URLs.
    pub default_registry_path: String,

    /// Directory that non-external URLs resolve against.
    pub local_root: PathBuf,

    /// Refresh TTL in days for sources that declare none.
    pub default_update_after_days: f64,

    /// Skip the HTML-error-page sniff on fetched text.
    ///
    /// The sniff misclassifies lists that open and close with angle
    /// brackets; products serving such lists can opt out.
    pub bypass_html_check: bool,

    /// Development mode: aggressive cache busting and raw registry fetches.
    pub debug: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            fetch_timeout: Duration::from_secs(30),
            update_delay: Duration::from_secs(120),
            manual_update_delay: Duration::from_millis(500),
            source_save_delay: Duration::from_millis(500),
            cache_save_delay: Duration::from_secs(30),
            bootstrap_url: String::new(),
            default_registry_path: "assets/assets.json".to_string(),
            local_root: PathBuf::from("."),
            default_update_after_days: 5.0,
            bypass_html_check: false,
            debug: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_deserialize_from_humantime() {
        let config: EngineConfig = serde_json::from_value(serde_json::json!({
            "fetch_timeout": "10s",
            "manual_update_delay": "250ms",
        }))
        .unwrap();
        assert_eq!(config.fetch_timeout, Duration::from_secs(10));
        assert_eq!(config.manual_update_delay, Duration::from_millis(250));
        assert_eq!(config.update_delay, Duration::from_secs(120));
    }
}
