//! Error types for asset operations.

use larder_backend::BackendError;
use thiserror::Error;

/// Error type observable from asset operations.
///
/// The `Display` rendering is the stable error code surfaced to callers and
/// recorded as `last_error` on source descriptors.
#[derive(Debug, Error)]
pub enum AssetError {
    /// No URL produced content, or no cache entry exists.
    #[error("ENOTFOUND")]
    NotFound,

    /// The transport produced no HTTP response at all.
    #[error("network error")]
    Network,

    /// A response with a non-2xx status.
    #[error("{code} {text}")]
    HttpStatus {
        /// HTTP status code.
        code: u16,
        /// Canonical status reason, possibly empty.
        text: String,
    },

    /// The body looks like an HTML error page rather than a text asset.
    #[error("Not a text file")]
    NotText,

    /// Transport-level failure reaching the given URL.
    #[error("Failed to connect to {url}")]
    CantConnect {
        /// The URL that could not be reached.
        url: String,
    },

    /// Storage failure.
    #[error(transparent)]
    Backend(#[from] BackendError),
}
