//! Differential updates over an external patch worker.
//!
//! Lists that advertise a `Diff-Path` can be brought up to date by applying
//! a small patch to the cached content instead of refetching the whole
//! list. Patch application itself is external; this module defines the
//! message protocol and drives a worker over a typed channel pair.
//!
//! Protocol, from the worker's perspective:
//!
//! 1. Announce [`WorkerMessage::Ready`]; the host responds with every hard
//!    (TTL-expired) task, `fetch` set.
//! 2. Request cached content with [`WorkerMessage::NeedText`] as needed; the
//!    host answers with [`HostMessage::Text`].
//! 3. Report each task with [`WorkerMessage::Updated`] or
//!    [`WorkerMessage::Failed`].
//! 4. Once all hard tasks are done, the host posts the soft (still within
//!    diff TTL) tasks without `fetch`; the worker applies only patches it
//!    already has at hand.
//! 5. [`WorkerMessage::Broken`] abandons the phase; the full-refresh phase
//!    still runs.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use larder_core::{
    AssetKey, CacheEntryPatch, DIFF_EXPIRES_FLOOR_DAYS, days_to_ms, now_ms, parse_list_header,
};

use crate::hub::AssetHub;
use crate::registry::WriteDetails;

/// One differential-update operation handed to the patch worker.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchTask {
    /// Asset key of the list to patch.
    pub name: AssetKey,
    /// Diff bundle the list belongs to.
    pub diff_name: String,
    /// Path of the patch resource.
    pub patch_path: String,
    /// Mirrors the patch may alternatively be fetched from.
    pub cdn_urls: Vec<String>,
    /// Fetch the patch now (hard candidates) rather than only applying
    /// patches already at hand (soft candidates).
    pub fetch: bool,
}

/// Host → worker messages.
#[derive(Debug)]
pub enum HostMessage {
    /// Run a patch operation.
    Apply(PatchTask),
    /// Cached content, answering [`WorkerMessage::NeedText`].
    Text {
        /// Asset key the content belongs to.
        name: AssetKey,
        /// The cached content, empty when unavailable.
        text: String,
    },
}

/// Worker → host messages.
#[derive(Debug)]
pub enum WorkerMessage {
    /// The worker is up and accepting tasks.
    Ready,
    /// The worker needs the current cached content of an asset.
    NeedText {
        /// Asset key whose content is needed.
        name: AssetKey,
    },
    /// A patch applied cleanly; `text` is the post-patch content.
    Updated {
        /// Asset key that was patched.
        name: AssetKey,
        /// The patched content.
        text: String,
        /// The URL the patch was fetched from.
        patch_url: String,
        /// Size of the fetched patch in bytes.
        patch_size: usize,
    },
    /// A single task failed; the rest of the phase continues.
    Failed {
        /// Asset key of the failed task.
        name: AssetKey,
        /// Why the patch did not apply.
        error: String,
    },
    /// The worker is unusable; the whole phase is abandoned.
    Broken {
        /// What broke.
        error: String,
    },
}

/// The channel pair connecting host and worker.
///
/// Dropping the pair ends the conversation from the worker's point of view.
pub struct PatchChannel {
    /// Host → worker sender.
    pub tx: mpsc::Sender<HostMessage>,
    /// Worker → host receiver.
    pub rx: mpsc::Receiver<WorkerMessage>,
}

/// Spawns patch workers; implemented by the embedding product.
pub trait PatchWorkerSpawner: Send + Sync {
    /// Starts a worker and returns the connected channel pair.
    fn spawn(&self) -> PatchChannel;
}

impl AssetHub {
    /// Runs the differential phase of an update cycle.
    ///
    /// Silently does nothing when no patch worker is configured or no hard
    /// candidates exist.
    pub(crate) async fn run_diff_phase(&self) {
        let Some(spawner) = self.inner.patch_worker.clone() else {
            return;
        };
        let (hard, soft) = match self.diff_candidates().await {
            Ok(candidates) => candidates,
            Err(error) => {
                warn!(%error, "diff candidate selection failed");
                return;
            }
        };
        if hard.is_empty() {
            debug!("no hard diff candidates, skipping diff phase");
            return;
        }
        debug!(hard = hard.len(), soft = soft.len(), "starting diff phase");

        let PatchChannel { tx, mut rx } = spawner.spawn();
        let mut hard = Some(hard);
        let mut soft = Some(soft);
        let mut pending = 0usize;

        while let Some(message) = rx.recv().await {
            match message {
                WorkerMessage::Ready => {
                    let Some(tasks) = hard.take() else { continue };
                    pending = tasks.len();
                    for task in tasks {
                        if tx.send(HostMessage::Apply(task)).await.is_err() {
                            return;
                        }
                    }
                }
                WorkerMessage::NeedText { name } => {
                    let text = self.inner.cache.read(&name, false).await.content;
                    if tx.send(HostMessage::Text { name, text }).await.is_err() {
                        return;
                    }
                }
                WorkerMessage::Updated {
                    name,
                    text,
                    patch_url,
                    patch_size,
                } => {
                    debug!(%name, %patch_url, patch_size, "differential update applied");
                    self.accept_patched(&name, &text).await;
                    {
                        let mut state = self.updater_state();
                        state.updated.push(name.clone());
                        state.fetched.insert(name);
                    }
                    pending = pending.saturating_sub(1);
                }
                WorkerMessage::Failed { name, error } => {
                    warn!(%name, %error, "differential update failed");
                    pending = pending.saturating_sub(1);
                }
                WorkerMessage::Broken { error } => {
                    warn!(%error, "patch worker broke, abandoning diff phase");
                    return;
                }
            }

            if pending == 0 {
                match soft.take() {
                    Some(tasks) if !tasks.is_empty() => {
                        pending = tasks.len();
                        for task in tasks {
                            if tx.send(HostMessage::Apply(task)).await.is_err() {
                                return;
                            }
                        }
                    }
                    _ => break,
                }
            }
        }
    }

    /// Partitions diff-capable assets into hard (TTL-expired) and soft
    /// candidates.
    async fn diff_candidates(
        &self,
    ) -> Result<(Vec<PatchTask>, Vec<PatchTask>), crate::AssetError> {
        let sources = self.inner.sources.snapshot().await?;
        let cache = self.inner.cache.snapshot().await?;
        let now = now_ms();

        let mut hard = Vec::new();
        let mut soft = Vec::new();
        for (key, entry) in &cache {
            let (Some(diff_name), Some(diff_path)) = (&entry.diff_name, &entry.diff_path) else {
                continue;
            };
            let task = PatchTask {
                name: key.clone(),
                diff_name: diff_name.clone(),
                patch_path: diff_path.clone(),
                cdn_urls: sources
                    .get(key)
                    .map(|source| source.cdn_urls.clone())
                    .unwrap_or_default(),
                fetch: false,
            };
            let diff_ttl = entry.diff_expires.unwrap_or(DIFF_EXPIRES_FLOOR_DAYS);
            if entry.write_time + days_to_ms(diff_ttl) > now {
                soft.push(task);
            } else {
                hard.push(PatchTask { fetch: true, ..task });
            }
        }
        Ok((hard, soft))
    }

    /// Writes patched content and its refreshed header metadata.
    async fn accept_patched(&self, key: &AssetKey, text: &str) {
        let header = parse_list_header(text);
        if let Err(error) = self
            .inner
            .cache
            .write(
                key,
                text,
                WriteDetails {
                    resource_time: header.last_modified,
                    url: None,
                    silent: false,
                },
            )
            .await
        {
            warn!(%key, %error, "failed to store patched content");
            return;
        }
        if let Err(error) = self
            .inner
            .cache
            .set_details(
                key,
                CacheEntryPatch::default()
                    .expires(header.expires_days)
                    .diff_expires(header.diff_expires_days)
                    .diff_name(header.diff_name)
                    .diff_path(header.diff_path),
            )
            .await
        {
            warn!(%key, %error, "failed to store patched header details");
        }
    }
}
