#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// Recursive `!#include` sublist assembly.
pub mod assemble;

/// Engine configuration.
pub mod config;

/// Differential updates and the patch-worker protocol.
pub mod diff;

/// Error types for asset operations.
pub mod error;

/// Single-URL text fetching.
pub mod fetch;

mod hub;
mod registry;
mod remote;
mod updater;

/// Storage-related re-exports.
///
/// Implement [`Storage`](backend::Storage) to persist registries and content
/// blobs in your product's store; [`MemoryBackend`](backend::MemoryBackend)
/// covers tests and standalone use.
pub mod backend {
    pub use larder_backend::{
        BackendError, BackendResult, MemoryBackend, MemorySettings, SettingsStore, Storage,
    };
}

pub use assemble::{ListAssembler, PassthroughPreparser, Preparser};
pub use config::EngineConfig;
pub use diff::{HostMessage, PatchChannel, PatchTask, PatchWorkerSpawner, WorkerMessage};
pub use error::AssetError;
pub use fetch::{FetchedText, HttpFetcher, TextFetcher};
pub use hub::{AssetContent, AssetHub, AssetHubBuilder, AssetMetadata, GetOptions};
pub use registry::KeyPattern;
pub use updater::{UpdateOptions, UpdaterStatus};

pub use larder_core::{
    AssetKey, AssetKind, CacheEntry, Event, KeepDecision, LastError, PolicyId, SourceDescriptor,
    SourcePatch, UpdateKeepPolicy,
};
