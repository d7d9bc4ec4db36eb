#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

mod backend;
mod error;
mod memory;
mod settings;

pub use backend::{BackendResult, Storage};
pub use error::BackendError;
pub use memory::{MemoryBackend, MemorySettings};
pub use settings::SettingsStore;
