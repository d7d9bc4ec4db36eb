//! Cache-first reads, URL fallback, user assets, registry maintenance.

mod common;

use common::{StaticFetcher, registry_snapshot, seed_registries};
use serde_json::json;

use larder::backend::{MemoryBackend, MemorySettings, Storage};
use larder::{AssetHub, EngineConfig, GetOptions, KeyPattern, SourcePatch};
use larder_core::now_ms;

fn hub_with(backend: &MemoryBackend, fetcher: &StaticFetcher) -> AssetHub {
    AssetHub::builder()
        .config(EngineConfig::default())
        .storage(backend.clone())
        .settings(MemorySettings::new())
        .fetcher(fetcher.clone())
        .build()
}

#[tokio::test]
async fn cache_hit_answers_without_fetching() {
    let backend = MemoryBackend::new();
    let now = now_ms();
    seed_registries(
        &backend,
        json!({
            "easylist": {
                "content": "filters",
                "contentURL": ["https://h/e.txt"],
                "hasRemoteURL": true
            }
        }),
        json!({
            "easylist": { "writeTime": now, "readTime": now, "resourceTime": 0 }
        }),
        &[("easylist", "! Title: x\n||a.com^")],
    )
    .await;
    let fetcher = StaticFetcher::new();
    let hub = hub_with(&backend, &fetcher);

    let result = hub.get("easylist").await;
    assert_eq!(result.key.as_str(), "easylist");
    assert_eq!(result.content, "! Title: x\n||a.com^");
    assert!(result.error.is_none());
    assert!(fetcher.hits().is_empty());
}

#[tokio::test]
async fn first_fetch_writes_through_to_cache() {
    let backend = MemoryBackend::new();
    seed_registries(
        &backend,
        json!({
            "easylist": {
                "content": "filters",
                "contentURL": ["https://h/e.txt"],
                "hasRemoteURL": true
            }
        }),
        json!({}),
        &[],
    )
    .await;
    let body = "! Last-Modified: Mon, 01 Jan 2024 00:00:00 GMT\n||x^\n";
    let fetcher = StaticFetcher::new().with("https://h/e.txt", body);
    let hub = hub_with(&backend, &fetcher);

    let result = hub.get("easylist").await;
    assert!(result.error.is_none());
    assert_eq!(result.content, body);

    hub.flush().await;
    assert_eq!(
        backend.get("cache/easylist").await.unwrap().unwrap(),
        bytes::Bytes::from(body)
    );
    let registry = registry_snapshot(&backend, "assetCacheRegistry").await;
    assert_eq!(registry["easylist"]["resourceTime"], 1_704_067_200_000i64);
    assert_eq!(registry["easylist"]["remoteURL"], "https://h/e.txt");

    // Second read is served from cache.
    let again = hub.get("easylist").await;
    assert_eq!(again.content, body);
    assert_eq!(fetcher.hit_count("https://h/e.txt"), 1);
}

#[tokio::test]
async fn read_tracking_advances_read_time() {
    let backend = MemoryBackend::new();
    seed_registries(
        &backend,
        json!({}),
        json!({
            "easylist": { "writeTime": 5, "readTime": 7, "resourceTime": 0 }
        }),
        &[("easylist", "||a.com^")],
    )
    .await;
    let hub = hub_with(&backend, &StaticFetcher::new());

    hub.get("easylist").await;
    hub.flush().await;
    let registry = registry_snapshot(&backend, "assetCacheRegistry").await;
    assert!(registry["easylist"]["readTime"].as_i64().unwrap() > 7);
}

#[tokio::test]
async fn transient_keys_skip_read_tracking() {
    let backend = MemoryBackend::new();
    seed_registries(
        &backend,
        json!({}),
        json!({
            "compiled/easylist": { "writeTime": 5, "readTime": 7, "resourceTime": 0 }
        }),
        &[("compiled/easylist", "compiled data")],
    )
    .await;
    let hub = hub_with(&backend, &StaticFetcher::new());

    let result = hub.get("compiled/easylist").await;
    assert_eq!(result.content, "compiled data");
    hub.flush().await;
    let registry = registry_snapshot(&backend, "assetCacheRegistry").await;
    assert_eq!(registry["compiled/easylist"]["readTime"], 7);
}

#[tokio::test]
async fn local_urls_gate_external_ones() {
    let backend = MemoryBackend::new();
    seed_registries(
        &backend,
        json!({
            "easylist": {
                "content": "filters",
                "contentURL": ["assets/easylist.txt", "https://h/e.txt"],
                "hasLocalURL": true,
                "hasRemoteURL": true
            }
        }),
        json!({}),
        &[],
    )
    .await;
    let fetcher = StaticFetcher::new().with("assets/easylist.txt", "||local^\n");
    let hub = hub_with(&backend, &fetcher);

    let result = hub.get("easylist").await;
    assert_eq!(result.content, "||local^\n");
    assert_eq!(fetcher.hit_count("https://h/e.txt"), 0);
    // Local content is not written back to the cache.
    assert!(!backend.contains("cache/easylist"));
}

#[tokio::test]
async fn url_key_without_descriptor_is_fetched_and_cached() {
    let backend = MemoryBackend::new();
    seed_registries(
        &backend,
        json!({ "placeholder": { "content": "internal" } }),
        json!({}),
        &[],
    )
    .await;
    let fetcher = StaticFetcher::new().with("https://h/ad-hoc.txt", "||adhoc^\n");
    let hub = hub_with(&backend, &fetcher);

    let result = hub
        .get_with(
            "https://h/ad-hoc.txt",
            GetOptions {
                need_source_url: true,
                ..GetOptions::default()
            },
        )
        .await;
    assert_eq!(result.content, "||adhoc^\n");
    assert_eq!(result.source_url.as_deref(), Some("https://h/ad-hoc.txt"));
    assert!(backend.contains("cache/https://h/ad-hoc.txt"));
}

#[tokio::test]
async fn dont_cache_leaves_store_untouched() {
    let backend = MemoryBackend::new();
    seed_registries(
        &backend,
        json!({
            "easylist": {
                "content": "filters",
                "contentURL": ["https://h/e.txt"],
                "hasRemoteURL": true
            }
        }),
        json!({}),
        &[],
    )
    .await;
    let fetcher = StaticFetcher::new().with("https://h/e.txt", "||x^\n");
    let hub = hub_with(&backend, &fetcher);

    let result = hub
        .get_with(
            "easylist",
            GetOptions {
                dont_cache: true,
                ..GetOptions::default()
            },
        )
        .await;
    assert_eq!(result.content, "||x^\n");
    assert!(!backend.contains("cache/easylist"));
}

#[tokio::test]
async fn user_assets_live_in_settings_storage() {
    let backend = MemoryBackend::new();
    seed_registries(&backend, json!({ "x": {} }), json!({}), &[]).await;
    let hub = hub_with(&backend, &StaticFetcher::new());

    hub.put("user-filters", "||tracker.example^").await.unwrap();
    let result = hub.get("user-filters").await;
    assert_eq!(result.content, "||tracker.example^");
    assert!(!backend.contains("cache/user-filters"));

    let missing = hub.get("user-none").await;
    assert_eq!(missing.error.unwrap().to_string(), "ENOTFOUND");
}

#[tokio::test]
async fn registration_merges_and_null_deletes() {
    let backend = MemoryBackend::new();
    seed_registries(&backend, json!({ "x": {} }), json!({}), &[]).await;
    let hub = hub_with(&backend, &StaticFetcher::new());

    hub.register_source(
        "easylist",
        SourcePatch::default()
            .content_urls(["https://h/e.txt"])
            .update_after(4.0),
    )
    .await
    .unwrap();

    let metadata = hub.metadata().await.unwrap();
    let entry = &metadata["easylist"];
    assert_eq!(entry.source.update_after, Some(4.0));
    assert!(entry.source.has_remote_url);
    assert!(entry.obsolete);

    let clear: SourcePatch = serde_json::from_value(json!({ "updateAfter": null })).unwrap();
    hub.register_source("easylist", clear).await.unwrap();
    let metadata = hub.metadata().await.unwrap();
    assert_eq!(metadata["easylist"].source.update_after, None);
}

#[tokio::test]
async fn unregister_leaves_no_trace() {
    let backend = MemoryBackend::new();
    seed_registries(
        &backend,
        json!({
            "easylist": {
                "content": "filters",
                "contentURL": ["https://h/e.txt"],
                "hasRemoteURL": true
            }
        }),
        json!({}),
        &[],
    )
    .await;
    let fetcher = StaticFetcher::new().with("https://h/e.txt", "||x^\n");
    let hub = hub_with(&backend, &fetcher);

    assert!(hub.get("easylist").await.is_usable());
    assert!(backend.contains("cache/easylist"));

    hub.unregister_source("easylist").await.unwrap();
    assert!(!backend.contains("cache/easylist"));
    assert!(!hub.metadata().await.unwrap().contains_key("easylist"));

    let gone = hub.get("easylist").await;
    assert_eq!(gone.error.unwrap().to_string(), "ENOTFOUND");
}

#[tokio::test]
async fn failures_record_last_error_and_success_clears_it() {
    let backend = MemoryBackend::new();
    seed_registries(
        &backend,
        json!({
            "easylist": {
                "content": "filters",
                "contentURL": ["https://h/e.txt"],
                "hasRemoteURL": true
            }
        }),
        json!({}),
        &[],
    )
    .await;
    let fetcher = StaticFetcher::new();
    let hub = hub_with(&backend, &fetcher);

    let failed = hub.get("easylist").await;
    assert!(failed.error.is_some());
    let metadata = hub.metadata().await.unwrap();
    let last_error = metadata["easylist"].source.last_error.clone();
    assert!(last_error.unwrap().error.contains("Failed to connect"));

    fetcher.set("https://h/e.txt", "||x^\n");
    assert!(hub.get("easylist").await.is_usable());
    let metadata = hub.metadata().await.unwrap();
    assert!(metadata["easylist"].source.last_error.is_none());
}

#[tokio::test]
async fn remove_by_regex_and_mark_dirty() {
    let backend = MemoryBackend::new();
    seed_registries(&backend, json!({ "x": {} }), json!({}), &[]).await;
    let hub = hub_with(&backend, &StaticFetcher::new());

    hub.put("compiled/easylist", "compiled a").await.unwrap();
    hub.put("compiled/badfilters", "compiled b").await.unwrap();
    hub.put("selfie/main", "selfie").await.unwrap();

    hub.remove(KeyPattern::Regex(regex::Regex::new("^compiled/").unwrap()))
        .await
        .unwrap();
    assert!(!backend.contains("cache/compiled/easylist"));
    assert!(!backend.contains("cache/compiled/badfilters"));
    assert!(backend.contains("cache/selfie/main"));

    hub.mark_dirty(KeyPattern::All, None).await.unwrap();
    hub.flush().await;
    let registry = registry_snapshot(&backend, "assetCacheRegistry").await;
    assert_eq!(registry["selfie/main"]["writeTime"], 0);
    // Content survives dirtying.
    assert!(backend.contains("cache/selfie/main"));
}

#[tokio::test]
async fn update_source_registry_purges_dropped_builtins() {
    let backend = MemoryBackend::new();
    seed_registries(
        &backend,
        json!({
            "assets.json": { "content": "internal", "contentURL": ["assets/assets.json"] },
            "easylist": {
                "content": "filters",
                "contentURL": ["https://h/e.txt"],
                "hasRemoteURL": true
            }
        }),
        json!({}),
        &[],
    )
    .await;
    let fetcher = StaticFetcher::new().with("https://h/e.txt", "||x^\n");
    let hub = hub_with(&backend, &fetcher);
    assert!(hub.get("easylist").await.is_usable());
    assert!(backend.contains("cache/easylist"));

    let payload = r#"{
        "assets.json": { "content": "internal", "contentURL": "assets/assets.json" },
        "easyprivacy": { "content": "filters", "contentURL": "https://h/ep.txt" }
    }"#;
    hub.update_source_registry(payload, false).await.unwrap();

    let metadata = hub.metadata().await.unwrap();
    assert!(!metadata.contains_key("easylist"));
    assert!(metadata.contains_key("easyprivacy"));
    assert!(!backend.contains("cache/easylist"));
    assert_eq!(
        metadata["assets.json"].source.default_listset,
        vec!["easyprivacy".to_string()]
    );
}
