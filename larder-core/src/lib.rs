#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

pub mod cache;
pub mod events;
pub mod header;
pub mod key;
pub mod patch;
pub mod source;

pub use cache::{CacheEntry, CacheEntryPatch, MS_PER_DAY, days_to_ms};
pub use events::{Event, EventBus, KeepDecision, KeepPolicies, PolicyId, UpdateKeepPolicy};
pub use header::{
    DIFF_EXPIRES_FLOOR_DAYS, EXPIRES_FLOOR_DAYS, HEADER_WINDOW, ListHeader, extract_field,
    is_diff_updatable, parse_expires, parse_last_modified, parse_list_header,
};
pub use key::{AssetKey, is_remote_url};
pub use patch::Patch;
pub use source::{AssetKind, LastError, SourceDescriptor, SourcePatch};

/// Current wall-clock time in epoch milliseconds.
///
/// All registry timestamps (`write_time`, `read_time`, `resource_time`,
/// `submit_time`) are epoch milliseconds from this clock.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
