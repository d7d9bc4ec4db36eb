//! The differential-update protocol between the engine and a patch worker.

mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{StaticFetcher, registry_snapshot, seed_registries};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};

use larder::backend::{MemoryBackend, MemorySettings};
use larder::{
    AssetHub, EngineConfig, HostMessage, PatchChannel, PatchTask, PatchWorkerSpawner,
    UpdateOptions, WorkerMessage,
};
use larder_core::{AssetKey, Event, now_ms};

/// A worker double: answers `Apply` by requesting the current text, then
/// reports the canned patched content. Tasks it has no patch for fail.
#[derive(Clone, Default)]
struct ScriptedWorker {
    patched: HashMap<String, String>,
    broken: bool,
    log: Arc<Mutex<Vec<PatchTask>>>,
}

impl ScriptedWorker {
    fn with_patch(mut self, key: &str, text: &str) -> Self {
        self.patched.insert(key.to_string(), text.to_string());
        self
    }

    fn broken() -> Self {
        ScriptedWorker {
            broken: true,
            ..ScriptedWorker::default()
        }
    }

    fn received(&self) -> Vec<PatchTask> {
        self.log.lock().unwrap().clone()
    }
}

impl PatchWorkerSpawner for ScriptedWorker {
    fn spawn(&self) -> PatchChannel {
        let (host_tx, mut worker_rx) = mpsc::channel::<HostMessage>(32);
        let (worker_tx, host_rx) = mpsc::channel::<WorkerMessage>(32);
        let patched = self.patched.clone();
        let broken = self.broken;
        let log = self.log.clone();

        tokio::spawn(async move {
            let _ = worker_tx.send(WorkerMessage::Ready).await;
            if broken {
                let _ = worker_tx
                    .send(WorkerMessage::Broken {
                        error: "patch module failed to load".into(),
                    })
                    .await;
                return;
            }
            while let Some(message) = worker_rx.recv().await {
                match message {
                    HostMessage::Apply(task) => {
                        log.lock().unwrap().push(task.clone());
                        if task.fetch && patched.contains_key(task.name.as_str()) {
                            let _ = worker_tx
                                .send(WorkerMessage::NeedText { name: task.name })
                                .await;
                        } else {
                            let _ = worker_tx
                                .send(WorkerMessage::Failed {
                                    name: task.name,
                                    error: "patch not at hand".into(),
                                })
                                .await;
                        }
                    }
                    HostMessage::Text { name, .. } => {
                        let text = patched.get(name.as_str()).cloned().unwrap_or_default();
                        let _ = worker_tx
                            .send(WorkerMessage::Updated {
                                name,
                                text,
                                patch_url: "https://cdn/patches/e.patch".into(),
                                patch_size: 123,
                            })
                            .await;
                    }
                }
            }
        });

        PatchChannel {
            tx: host_tx,
            rx: host_rx,
        }
    }
}

fn hub_with(
    backend: &MemoryBackend,
    fetcher: &StaticFetcher,
    worker: &ScriptedWorker,
) -> AssetHub {
    AssetHub::builder()
        .config(EngineConfig::default())
        .storage(backend.clone())
        .settings(MemorySettings::new())
        .fetcher(fetcher.clone())
        .patch_worker(worker.clone())
        .build()
}

async fn wait_for_cycle(events: &mut broadcast::Receiver<Event>) -> Vec<AssetKey> {
    tokio::time::timeout(Duration::from_secs(600), async {
        loop {
            match events.recv().await {
                Ok(Event::UpdateCycleCompleted { updated }) => return (*updated).clone(),
                Ok(_) => continue,
                Err(error) => panic!("event stream ended: {error}"),
            }
        }
    })
    .await
    .expect("update cycle did not complete")
}

fn diffable_sources() -> serde_json::Value {
    json!({
        "easylist": {
            "content": "filters",
            "contentURL": ["https://h/e.txt"],
            "updateAfter": 1,
            "hasRemoteURL": true
        }
    })
}

const PATCHED: &str = "\
! Title: EasyList
! Last-Modified: Tue, 02 Jan 2024 00:00:00 GMT
! Expires: 1d
! Diff-Expires: 6h
! Diff-Name: easylist
! Diff-Path: ../patches/e2.txt#name:2
||new-rule^
";

#[tokio::test(start_paused = true)]
async fn hard_patch_applies_and_refreshes_metadata() {
    let backend = MemoryBackend::new();
    seed_registries(
        &backend,
        diffable_sources(),
        json!({
            "easylist": {
                "writeTime": 1000,
                "readTime": now_ms() + 60_000,
                "diffName": "easylist",
                "diffPath": "../patches/e.txt#name:1",
                "diffExpires": 0.25
            }
        }),
        &[("easylist", "! Diff-Name: easylist\n||old-rule^\n")],
    )
    .await;
    let fetcher = StaticFetcher::new().with("https://h/e.txt", "||full-fetch^\n");
    let worker = ScriptedWorker::default().with_patch("easylist", PATCHED);
    let hub = hub_with(&backend, &fetcher, &worker);

    let mut events = hub.events();
    hub.update_start(UpdateOptions::default());
    let updated = wait_for_cycle(&mut events).await;

    assert_eq!(updated, vec![AssetKey::new("easylist")]);
    assert_eq!(hub.get("easylist").await.content, PATCHED);
    // A successful patch leaves no reason for a full refetch.
    assert_eq!(fetcher.hit_count("https://h/e.txt"), 0);

    hub.flush().await;
    let registry = registry_snapshot(&backend, "assetCacheRegistry").await;
    assert_eq!(
        registry["easylist"]["resourceTime"],
        1_704_153_600_000i64
    );
    assert_eq!(registry["easylist"]["diffPath"], "../patches/e2.txt#name:2");
    assert_eq!(registry["easylist"]["expires"], 1.0);
    assert_eq!(registry["easylist"]["diffExpires"], 0.25);
}

#[tokio::test(start_paused = true)]
async fn soft_tasks_are_posted_after_hard_ones_complete() {
    let backend = MemoryBackend::new();
    seed_registries(
        &backend,
        json!({}),
        json!({
            "hard-list": {
                "writeTime": 1000,
                "readTime": now_ms() + 60_000,
                "diffName": "hard-list",
                "diffPath": "../patches/h.txt",
                "diffExpires": 0.25
            },
            "soft-list": {
                "writeTime": now_ms(),
                "readTime": now_ms() + 60_000,
                "diffName": "soft-list",
                "diffPath": "../patches/s.txt",
                "diffExpires": 0.25
            }
        }),
        &[("hard-list", "||old-h^\n"), ("soft-list", "||old-s^\n")],
    )
    .await;
    let worker = ScriptedWorker::default().with_patch("hard-list", PATCHED);
    let hub = hub_with(&backend, &StaticFetcher::new(), &worker);

    let mut events = hub.events();
    hub.update_start(UpdateOptions::default());
    wait_for_cycle(&mut events).await;

    let received = worker.received();
    assert_eq!(received.len(), 2);
    assert_eq!(received[0].name.as_str(), "hard-list");
    assert!(received[0].fetch);
    assert_eq!(received[1].name.as_str(), "soft-list");
    assert!(!received[1].fetch);
}

#[tokio::test(start_paused = true)]
async fn no_hard_candidates_skips_the_diff_phase() {
    let backend = MemoryBackend::new();
    seed_registries(
        &backend,
        json!({}),
        json!({
            "soft-list": {
                "writeTime": now_ms(),
                "readTime": now_ms() + 60_000,
                "diffName": "soft-list",
                "diffPath": "../patches/s.txt",
                "diffExpires": 0.25
            }
        }),
        &[("soft-list", "||old-s^\n")],
    )
    .await;
    let worker = ScriptedWorker::default();
    let hub = hub_with(&backend, &StaticFetcher::new(), &worker);

    let mut events = hub.events();
    hub.update_start(UpdateOptions::default());
    wait_for_cycle(&mut events).await;

    assert!(worker.received().is_empty());
}

#[tokio::test(start_paused = true)]
async fn broken_worker_abandons_diffs_but_not_the_cycle() {
    let backend = MemoryBackend::new();
    seed_registries(
        &backend,
        diffable_sources(),
        json!({
            "easylist": {
                "writeTime": 1000,
                "readTime": now_ms() + 60_000,
                "diffName": "easylist",
                "diffPath": "../patches/e.txt#name:1",
                "diffExpires": 0.25
            }
        }),
        &[("easylist", "||old-rule^\n")],
    )
    .await;
    let fetcher = StaticFetcher::new().with("https://h/e.txt", "||full-fetch^\n");
    let hub = hub_with(&backend, &fetcher, &ScriptedWorker::broken());

    let mut events = hub.events();
    hub.update_start(UpdateOptions::default());
    let updated = wait_for_cycle(&mut events).await;

    // The full-refresh phase picked the asset up instead.
    assert_eq!(updated, vec![AssetKey::new("easylist")]);
    assert_eq!(hub.get("easylist").await.content, "||full-fetch^\n");
    assert_eq!(fetcher.hit_count("https://h/e.txt"), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_patches_fall_back_to_full_refresh() {
    let backend = MemoryBackend::new();
    seed_registries(
        &backend,
        diffable_sources(),
        json!({
            "easylist": {
                "writeTime": 1000,
                "readTime": now_ms() + 60_000,
                "diffName": "easylist",
                "diffPath": "../patches/e.txt#name:1",
                "diffExpires": 0.25
            }
        }),
        &[("easylist", "||old-rule^\n")],
    )
    .await;
    let fetcher = StaticFetcher::new().with("https://h/e.txt", "||full-fetch^\n");
    // No patch at hand: every Apply fails.
    let worker = ScriptedWorker::default();
    let hub = hub_with(&backend, &fetcher, &worker);

    let mut events = hub.events();
    hub.update_start(UpdateOptions::default());
    let updated = wait_for_cycle(&mut events).await;

    assert_eq!(updated, vec![AssetKey::new("easylist")]);
    assert_eq!(hub.get("easylist").await.content, "||full-fetch^\n");
}
