//! Single-URL text fetching.
//!
//! [`HttpFetcher`] implements the fetch contract: plain GET, a *no-progress*
//! timeout that resets on every delivered byte, rejection of HTML error
//! pages, and a cache-busting query parameter outside remote-server-friendly
//! mode. Non-external URLs resolve as files under the configured local root.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{AGE, DATE, HeaderMap};
use tokio::time::timeout;
use tracing::warn;

use larder_core::{extract_field, is_remote_url, now_ms, parse_last_modified};

use crate::config::EngineConfig;
use crate::error::AssetError;

/// Outcome of a single text fetch.
///
/// Failures are carried in-band: `content` is empty and `error` is set.
/// `url` always echoes the caller-supplied URL, not the rewritten one.
#[derive(Debug, Default)]
pub struct FetchedText {
    /// The URL the caller asked for.
    pub url: String,
    /// Fetched text, empty on failure.
    pub content: String,
    /// Origin timestamp: content `Last-Modified`, else HTTP `Date − Age`,
    /// else `0`.
    pub resource_time: i64,
    /// HTTP status, `None` when no response was obtained (transport failure
    /// or local read).
    pub status: Option<u16>,
    /// What went wrong, when anything did.
    pub error: Option<AssetError>,
}

impl FetchedText {
    /// A failed fetch outcome for `url`.
    pub fn failure(url: impl Into<String>, error: AssetError) -> Self {
        FetchedText {
            url: url.into(),
            error: Some(error),
            ..FetchedText::default()
        }
    }

    /// `true` when the fetch produced usable content.
    pub fn is_usable(&self) -> bool {
        self.error.is_none() && !self.content.is_empty()
    }
}

/// Seam over text fetching, so orchestration is testable without a network.
#[async_trait]
pub trait TextFetcher: Send + Sync {
    /// Fetches a text asset from a single URL.
    async fn fetch_text(&self, url: &str) -> FetchedText;

    /// Toggled by the update scheduler during automatic cycles: prefer
    /// mirrors and skip cache busting.
    fn set_remote_server_friendly(&self, _on: bool) {}

    /// Current remote-server-friendly state.
    fn remote_server_friendly(&self) -> bool {
        false
    }
}

/// The production [`TextFetcher`] over reqwest.
pub struct HttpFetcher {
    client: reqwest::Client,
    config: Arc<EngineConfig>,
    remote_server_friendly: AtomicBool,
}

impl HttpFetcher {
    /// Creates a fetcher with its own HTTP client.
    pub fn new(config: Arc<EngineConfig>) -> Self {
        HttpFetcher {
            client: reqwest::Client::new(),
            config,
            remote_server_friendly: AtomicBool::new(false),
        }
    }

    /// Cache-busting token appended to external URLs.
    ///
    /// Hour-granular modulo 13 normally, second-granular modulo 86413 in
    /// debug builds. Both moduli are prime to minimize cross-day collisions.
    pub(crate) fn cache_bust_token(now_ms: i64, debug: bool) -> i64 {
        if debug {
            (now_ms / 1_000) % 86_413
        } else {
            (now_ms / 3_600_000) % 13
        }
    }

    fn bust_url(&self, url: &str) -> String {
        let token = Self::cache_bust_token(now_ms(), self.config.debug);
        let separator = if url.contains('?') { '&' } else { '?' };
        format!("{url}{separator}_={token}")
    }

    async fn fetch_local(&self, url: &str) -> FetchedText {
        let path = self.config.local_root.join(url);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let resource_time = resource_time_from_content(&content);
                FetchedText {
                    url: url.to_string(),
                    content,
                    resource_time,
                    status: None,
                    error: None,
                }
            }
            Err(error) => {
                warn!(url, %error, "local asset read failed");
                FetchedText::failure(url, AssetError::CantConnect { url: url.to_string() })
            }
        }
    }

    async fn fetch_remote(&self, url: &str) -> FetchedText {
        let target = if self.remote_server_friendly() {
            url.to_string()
        } else {
            self.bust_url(url)
        };

        let response = match timeout(self.config.fetch_timeout, self.client.get(&target).send()).await
        {
            Err(_) => {
                warn!(url, "no response within the progress timeout");
                return FetchedText::failure(url, AssetError::CantConnect { url: url.to_string() });
            }
            Ok(Err(error)) => {
                warn!(url, %error, "request failed");
                return FetchedText::failure(url, AssetError::CantConnect { url: url.to_string() });
            }
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        if !status.is_success() {
            return FetchedText {
                url: url.to_string(),
                status: Some(status.as_u16()),
                error: Some(AssetError::HttpStatus {
                    code: status.as_u16(),
                    text: status.canonical_reason().unwrap_or_default().to_string(),
                }),
                ..FetchedText::default()
            };
        }

        let header_time = resource_time_from_headers(response.headers());

        // The timeout covers time between chunks, not the whole body: as
        // long as bytes keep arriving the request stays alive.
        let mut stream = response.bytes_stream();
        let mut body: Vec<u8> = Vec::new();
        loop {
            match timeout(self.config.fetch_timeout, stream.next()).await {
                Err(_) => {
                    warn!(url, "fetch made no progress, aborting");
                    return FetchedText::failure(
                        url,
                        AssetError::CantConnect {
                            url: url.to_string(),
                        },
                    );
                }
                Ok(None) => break,
                Ok(Some(Ok(chunk))) => body.extend_from_slice(&chunk),
                Ok(Some(Err(error))) => {
                    warn!(url, %error, "body stream failed");
                    return FetchedText::failure(
                        url,
                        AssetError::CantConnect {
                            url: url.to_string(),
                        },
                    );
                }
            }
        }

        let content = String::from_utf8_lossy(&body).into_owned();
        let trimmed = content.trim();
        if !self.config.bypass_html_check && trimmed.starts_with('<') && trimmed.ends_with('>') {
            return FetchedText {
                url: url.to_string(),
                status: Some(status.as_u16()),
                error: Some(AssetError::NotText),
                ..FetchedText::default()
            };
        }

        let content_time = resource_time_from_content(&content);
        FetchedText {
            url: url.to_string(),
            content,
            resource_time: if content_time > 0 {
                content_time
            } else {
                header_time
            },
            status: Some(status.as_u16()),
            error: None,
        }
    }
}

#[async_trait]
impl TextFetcher for HttpFetcher {
    async fn fetch_text(&self, url: &str) -> FetchedText {
        if is_remote_url(url) {
            self.fetch_remote(url).await
        } else {
            self.fetch_local(url).await
        }
    }

    fn set_remote_server_friendly(&self, on: bool) {
        self.remote_server_friendly.store(on, Ordering::Relaxed);
    }

    fn remote_server_friendly(&self) -> bool {
        self.remote_server_friendly.load(Ordering::Relaxed)
    }
}

fn resource_time_from_content(content: &str) -> i64 {
    extract_field(content, "Last-Modified")
        .map(|value| parse_last_modified(&value))
        .unwrap_or(0)
}

fn resource_time_from_headers(headers: &HeaderMap) -> i64 {
    let date_ms = headers
        .get(DATE)
        .and_then(|value| value.to_str().ok())
        .map(parse_last_modified)
        .unwrap_or(0);
    if date_ms <= 0 {
        return 0;
    }
    let age_ms = headers
        .get(AGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<i64>().ok())
        .unwrap_or(0)
        * 1_000;
    date_ms - age_ms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bust_token_is_hour_granular_by_default() {
        let now = 1_704_067_200_000;
        assert_eq!(
            HttpFetcher::cache_bust_token(now, false),
            (now / 3_600_000) % 13
        );
        assert_eq!(
            HttpFetcher::cache_bust_token(now, true),
            (now / 1_000) % 86_413
        );
    }

    #[test]
    fn header_resource_time_subtracts_age() {
        let mut headers = HeaderMap::new();
        headers.insert(DATE, "Mon, 01 Jan 2024 00:00:10 GMT".parse().unwrap());
        headers.insert(AGE, "10".parse().unwrap());
        assert_eq!(resource_time_from_headers(&headers), 1_704_067_200_000);

        let mut headers = HeaderMap::new();
        headers.insert(AGE, "10".parse().unwrap());
        assert_eq!(resource_time_from_headers(&headers), 0);
    }

    #[test]
    fn content_last_modified_wins_over_nothing() {
        let content = "! Last-Modified: Mon, 01 Jan 2024 00:00:00 GMT\n||x^";
        assert_eq!(resource_time_from_content(content), 1_704_067_200_000);
        assert_eq!(resource_time_from_content("||x^"), 0);
    }
}
