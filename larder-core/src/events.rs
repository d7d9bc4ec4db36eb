//! Engine notifications and update-keep policy hooks.
//!
//! The engine publishes lifecycle notifications on a broadcast [`EventBus`];
//! subscribers that fall behind simply miss events. Separately, update-cycle
//! eviction consults registered [`UpdateKeepPolicy`] hooks: a key any hook
//! answers [`KeepDecision::Keep`] for is retained as an update candidate even
//! when it has gone unread since startup.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::key::AssetKey;
use crate::source::SourceDescriptor;

/// Engine lifecycle notifications.
#[derive(Debug, Clone)]
pub enum Event {
    /// The source registry was reingested from `assets.json`.
    SourceRegistryUpdated {
        /// The registry content after the update.
        new: Arc<HashMap<AssetKey, SourceDescriptor>>,
        /// The registry content before the update.
        old: Arc<HashMap<AssetKey, SourceDescriptor>>,
    },
    /// A built-in source appeared that was not previously registered.
    BuiltinSourceAdded {
        /// Key of the new source.
        key: AssetKey,
    },
    /// Cached content for the key was written or removed.
    AssetUpdated {
        /// Key of the changed asset.
        key: AssetKey,
    },
    /// A refresh attempt failed on every candidate URL.
    AssetUpdateFailed {
        /// Key of the failed asset.
        key: AssetKey,
        /// Observable error code.
        error: String,
    },
    /// An update cycle finished.
    UpdateCycleCompleted {
        /// Keys whose content changed during the cycle, in update order.
        updated: Arc<Vec<AssetKey>>,
    },
}

/// Broadcast fan-out of [`Event`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Creates a bus retaining up to `capacity` undelivered events per
    /// subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        EventBus { tx }
    }

    /// Subscribes to all events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publishes an event.
    pub fn emit(&self, event: Event) {
        // Ignore send errors - it just means no one is listening.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(64)
    }
}

/// Whether an unused asset should survive update-cycle eviction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeepDecision {
    /// Retain the asset and treat it as an update candidate.
    Keep,
    /// No opinion; the scheduler applies its default eviction rule.
    #[default]
    Default,
}

/// Hook consulted before the update scheduler evicts an unused asset.
pub trait UpdateKeepPolicy: Send + Sync {
    /// Decides whether `key` must be kept.
    fn keep(&self, key: &AssetKey) -> KeepDecision;
}

impl<F> UpdateKeepPolicy for F
where
    F: Fn(&AssetKey) -> KeepDecision + Send + Sync,
{
    fn keep(&self, key: &AssetKey) -> KeepDecision {
        self(key)
    }
}

/// Handle for removing a registered keep policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PolicyId(u64);

/// Registry of [`UpdateKeepPolicy`] hooks.
#[derive(Default, Clone)]
pub struct KeepPolicies {
    inner: Arc<KeepPoliciesInner>,
}

#[derive(Default)]
struct KeepPoliciesInner {
    hooks: DashMap<u64, Arc<dyn UpdateKeepPolicy>>,
    next_id: AtomicU64,
}

impl KeepPolicies {
    /// Registers a policy hook; returns its removal handle.
    pub fn add(&self, policy: Arc<dyn UpdateKeepPolicy>) -> PolicyId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.hooks.insert(id, policy);
        PolicyId(id)
    }

    /// Removes a previously registered hook; `true` when it existed.
    pub fn remove(&self, id: PolicyId) -> bool {
        self.inner.hooks.remove(&id.0).is_some()
    }

    /// `true` when any registered hook answers [`KeepDecision::Keep`].
    pub fn must_keep(&self, key: &AssetKey) -> bool {
        self.inner
            .hooks
            .iter()
            .any(|hook| hook.keep(key) == KeepDecision::Keep)
    }
}
