//! The update scheduler: periodic refresh of remote-backed assets.
//!
//! A cycle runs the differential phase first (cheap patches over the patch
//! worker), then walks full-refresh candidates oldest-first, one fetch per
//! pacing interval. Candidates come from the intersection of the two
//! registries; assets unread since process start are evicted instead,
//! unless a keep policy claims them.

use std::collections::HashSet;
use std::sync::MutexGuard;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info_span, warn};

use larder_core::{AssetKey, Event, days_to_ms, now_ms};

use crate::hub::AssetHub;
use crate::registry::{ASSETS_JSON_KEY, KeyPattern};

/// Whether an update cycle is running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UpdaterStatus {
    /// No cycle in progress.
    #[default]
    Idle,
    /// A cycle is refreshing assets.
    Updating,
}

/// Options for [`AssetHub::update_start`].
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Pacing delay between full refreshes; defaults to the configured
    /// background delay. An already running cycle only ever speeds up.
    pub delay: Option<Duration>,
    /// Automatic (background) cycle: fetches run remote-server-friendly,
    /// preferring CDN mirrors and skipping cache busting.
    pub auto: bool,
}

pub(crate) struct UpdaterState {
    pub(crate) status: UpdaterStatus,
    pub(crate) fetched: HashSet<AssetKey>,
    pub(crate) updated: Vec<AssetKey>,
    pub(crate) delay: Duration,
    pub(crate) auto: bool,
    pub(crate) task: Option<JoinHandle<()>>,
}

impl UpdaterState {
    pub(crate) fn new(delay: Duration) -> Self {
        UpdaterState {
            status: UpdaterStatus::Idle,
            fetched: HashSet::new(),
            updated: Vec::new(),
            delay,
            auto: false,
            task: None,
        }
    }
}

impl AssetHub {
    pub(crate) fn updater_state(&self) -> MutexGuard<'_, UpdaterState> {
        self.inner.updater.lock().expect("updater state poisoned")
    }

    /// Starts an update cycle, or speeds up the one already running.
    pub fn update_start(&self, options: UpdateOptions) {
        let requested = options.delay.unwrap_or(self.inner.config.update_delay);
        let mut state = self.updater_state();
        state.auto = options.auto;
        if state.status == UpdaterStatus::Updating {
            // The pacing delay never rises within an active cycle.
            state.delay = state.delay.min(requested);
            drop(state);
            self.inner.update_nudge.notify_waiters();
            return;
        }

        state.status = UpdaterStatus::Updating;
        state.delay = requested;
        state.fetched.clear();
        state.updated.clear();
        let hub = self.clone();
        state.task = Some(tokio::spawn(
            async move { hub.run_update_cycle().await }.instrument(info_span!("update_cycle")),
        ));
    }

    /// Cancels the running cycle, finalizing it if one was active.
    pub fn update_stop(&self) {
        let mut state = self.updater_state();
        if let Some(task) = state.task.take() {
            task.abort();
        }
        if state.status == UpdaterStatus::Updating {
            self.finish_cycle(&mut state);
        }
    }

    /// `true` while a manually triggered cycle is running.
    ///
    /// Background cycles pace slowly; a cycle counts as manual when its
    /// delay is at or below the configured manual threshold.
    pub fn is_updating(&self) -> bool {
        let state = self.updater_state();
        state.status == UpdaterStatus::Updating
            && state.delay <= self.inner.config.manual_update_delay
    }

    fn finish_cycle(&self, state: &mut UpdaterState) {
        state.status = UpdaterStatus::Idle;
        state.delay = self.inner.config.update_delay;
        state.fetched.clear();
        let updated = std::mem::take(&mut state.updated);
        self.inner.events.emit(Event::UpdateCycleCompleted {
            updated: std::sync::Arc::new(updated),
        });
    }

    async fn run_update_cycle(self) {
        self.run_diff_phase().await;

        loop {
            let candidate = match self.next_candidate().await {
                Ok(candidate) => candidate,
                Err(error) => {
                    warn!(%error, "candidate selection failed, ending cycle");
                    None
                }
            };
            let Some(key) = candidate else { break };

            let auto = {
                let mut state = self.updater_state();
                state.fetched.insert(key.clone());
                state.auto
            };
            self.inner.fetcher.set_remote_server_friendly(auto);

            let result = if key.as_str() == ASSETS_JSON_KEY && self.inner.config.debug {
                // Development builds reload the registry straight from the
                // bundled copy.
                let fetched = self
                    .inner
                    .fetcher
                    .fetch_text(&self.inner.config.default_registry_path)
                    .await;
                crate::hub::AssetContent {
                    key: key.clone(),
                    content: fetched.content,
                    source_url: Some(fetched.url),
                    error: fetched.error,
                }
            } else {
                self.get_remote(key.clone()).await
            };
            self.inner.fetcher.set_remote_server_friendly(false);

            if result.is_usable() {
                if key.as_str() == ASSETS_JSON_KEY
                    && let Err(error) = self.update_source_registry(&result.content, false).await
                {
                    warn!(%error, "failed to reingest source registry");
                }
                self.updater_state().updated.push(key.clone());
            } else if let Some(error) = &result.error {
                self.inner.events.emit(Event::AssetUpdateFailed {
                    key: key.clone(),
                    error: error.to_string(),
                });
            }
            // Empty content without an error is a staleness-rejected
            // refresh: neither updated nor failed.

            // Paced wait before the next candidate; update_start may
            // shorten the delay mid-sleep.
            loop {
                let delay = self.updater_state().delay;
                tokio::select! {
                    _ = tokio::time::sleep(delay) => break,
                    _ = self.inner.update_nudge.notified() => continue,
                }
            }
        }

        let mut state = self.updater_state();
        state.task = None;
        if state.status == UpdaterStatus::Updating {
            self.finish_cycle(&mut state);
        }
    }

    /// Picks the oldest due candidate, evicting unused assets on the way.
    async fn next_candidate(&self) -> Result<Option<AssetKey>, crate::AssetError> {
        let sources = self.inner.sources.snapshot().await?;
        let cache = self.inner.cache.snapshot().await?;
        let start_time = self.inner.cache.start_time();
        let now = now_ms();
        let fetched = self.updater_state().fetched.clone();

        let mut candidates: Vec<(AssetKey, i64)> = Vec::new();
        let mut garbage: Vec<AssetKey> = Vec::new();
        for (key, source) in &sources {
            if !source.has_remote_url || fetched.contains(key) {
                continue;
            }
            let Some(entry) = cache.get(key) else { continue };

            if entry.read_time < start_time && !self.inner.keep_policies.must_keep(key) {
                // Unused since startup; reclaim instead of refreshing.
                garbage.push(key.clone());
                continue;
            }

            let ttl = entry
                .ttl_days(source.update_after)
                .unwrap_or(self.inner.config.default_update_after_days);
            if entry.write_time + days_to_ms(ttl) > now {
                continue;
            }
            candidates.push((key.clone(), entry.write_time));
        }

        for key in garbage {
            debug!(%key, "evicting cached asset unused since startup");
            if let Err(error) = self
                .inner
                .cache
                .remove(&KeyPattern::Exact(key.clone()), false)
                .await
            {
                warn!(%key, %error, "eviction failed");
            }
        }

        candidates.sort_by_key(|(_, write_time)| *write_time);
        Ok(candidates.into_iter().next().map(|(key, _)| key))
    }
}
