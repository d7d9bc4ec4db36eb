//! Cache registry entries: per-asset write/read/resource times and TTLs.

use serde::{Deserialize, Serialize};

use crate::patch::Patch;

/// Milliseconds in a day; registry TTLs are fractional days.
pub const MS_PER_DAY: i64 = 86_400_000;

/// Converts a fractional-day TTL to milliseconds.
pub fn days_to_ms(days: f64) -> i64 {
    (days * MS_PER_DAY as f64) as i64
}

/// Metadata tracked for one cached asset.
///
/// The content itself lives in a sibling storage entry (`cache/<key>`); an
/// entry without a backing blob reads as absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheEntry {
    /// Epoch ms of the last successful write; `0` means dirty.
    pub write_time: i64,
    /// Epoch ms of the last read that requested read tracking.
    pub read_time: i64,
    /// Authoritative origin timestamp of the content; `0` if unknown.
    pub resource_time: i64,
    /// The URL the last successful fetch actually used.
    #[serde(rename = "remoteURL", skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
    /// Full-refresh TTL in days, overriding the source default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<f64>,
    /// Differential-refresh TTL in days.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff_expires: Option<f64>,
    /// Identity of the diff bundle this asset belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff_name: Option<String>,
    /// Path of the patch resource for differential updates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff_path: Option<String>,
}

impl CacheEntry {
    /// Effective full-refresh TTL: the entry's own, else the source default.
    pub fn ttl_days(&self, source_default: Option<f64>) -> Option<f64> {
        self.expires.or(source_default)
    }

    /// `true` when the entry is older than the given TTL.
    pub fn is_obsolete(&self, ttl_days: f64, now: i64) -> bool {
        self.write_time + days_to_ms(ttl_days) <= now
    }

    /// Merges a patch into this entry; returns `true` when anything changed.
    pub fn merge(&mut self, patch: CacheEntryPatch) -> bool {
        let mut changed = false;
        changed |= patch.write_time.apply_value(&mut self.write_time);
        changed |= patch.resource_time.apply_value(&mut self.resource_time);
        changed |= patch.remote_url.apply(&mut self.remote_url);
        changed |= patch.expires.apply(&mut self.expires);
        changed |= patch.diff_expires.apply(&mut self.diff_expires);
        changed |= patch.diff_name.apply(&mut self.diff_name);
        changed |= patch.diff_path.apply(&mut self.diff_path);
        changed
    }
}

/// Field-by-field merge into a [`CacheEntry`].
#[derive(Debug, Clone, Default)]
pub struct CacheEntryPatch {
    /// Epoch ms of the last successful write.
    pub write_time: Patch<i64>,
    /// Authoritative origin timestamp of the content.
    pub resource_time: Patch<i64>,
    /// The URL the last successful fetch actually used.
    pub remote_url: Patch<String>,
    /// Full-refresh TTL in days.
    pub expires: Patch<f64>,
    /// Differential-refresh TTL in days.
    pub diff_expires: Patch<f64>,
    /// Identity of the diff bundle.
    pub diff_name: Patch<String>,
    /// Path of the patch resource.
    pub diff_path: Patch<String>,
}

impl CacheEntryPatch {
    /// Sets the write time.
    pub fn write_time(mut self, epoch_ms: i64) -> Self {
        self.write_time = Patch::Set(epoch_ms);
        self
    }

    /// Sets the resource time.
    pub fn resource_time(mut self, epoch_ms: i64) -> Self {
        self.resource_time = Patch::Set(epoch_ms);
        self
    }

    /// Sets or clears the full-refresh TTL.
    pub fn expires(mut self, days: f64) -> Self {
        self.expires = if days > 0.0 {
            Patch::Set(days)
        } else {
            Patch::Clear
        };
        self
    }

    /// Sets or clears the differential-refresh TTL.
    pub fn diff_expires(mut self, days: f64) -> Self {
        self.diff_expires = if days > 0.0 {
            Patch::Set(days)
        } else {
            Patch::Clear
        };
        self
    }

    /// Sets or clears the diff bundle identity.
    pub fn diff_name(mut self, name: Option<String>) -> Self {
        self.diff_name = Patch::from_option(name);
        self
    }

    /// Sets or clears the patch resource path.
    pub fn diff_path(mut self, path: Option<String>) -> Self {
        self.diff_path = Patch::from_option(path);
        self
    }
}
