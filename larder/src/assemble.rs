//! Recursive filter-list assembly.
//!
//! A filter list may pull in sublists through `!#include <path>` directives.
//! The assembler fetches the main list, expands every include into a fetch of
//! its own, and splices the results back in place, delimited by sentinel
//! banners. Any sublist failure aborts the whole assembly: the caller either
//! gets the complete list or nothing.
//!
//! Include paths resolve relative to the list that contains them, not the
//! root list, so an included list may itself include sublists beside it.

use std::collections::HashSet;
use std::ops::Range;
use std::sync::LazyLock;

use futures::future::join_all;
use regex::Regex;
use url::Url;

use larder_core::is_diff_updatable;

use crate::fetch::{FetchedText, TextFetcher};

static RE_INCLUDE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^!#include +(\S+)").expect("valid include pattern"));

/// Seam over the filter-list preparser.
///
/// The preparser knows `!#if` scoping; the assembler must not expand
/// includes sitting inside an excluded branch.
pub trait Preparser: Send + Sync {
    /// Splits content into slices tagged active (`true`) or inactive
    /// (`false`, inside an excluded `!#if` branch), in document order.
    fn split(&self, content: &str) -> Vec<(Range<usize>, bool)>;
}

/// Treats the entire list as one active slice.
pub struct PassthroughPreparser;

impl Preparser for PassthroughPreparser {
    fn split(&self, content: &str) -> Vec<(Range<usize>, bool)> {
        vec![(0..content.len(), true)]
    }
}

enum Piece {
    /// Fully resolved text.
    Text(String),
    /// A sublist scheduled for fetching.
    Fetch(String),
    /// A fetched part not yet scanned for includes.
    Resolved(FetchedText),
}

/// Assembles a main list and its `!#include` sublists into one text.
pub struct ListAssembler<'a> {
    fetcher: &'a dyn TextFetcher,
    preparser: &'a dyn Preparser,
}

impl<'a> ListAssembler<'a> {
    /// Creates an assembler over the given fetcher and preparser.
    pub fn new(fetcher: &'a dyn TextFetcher, preparser: &'a dyn Preparser) -> Self {
        ListAssembler { fetcher, preparser }
    }

    /// Fetches `main_url` and inlines its sublists.
    ///
    /// On success the outcome carries the spliced content (newline
    /// terminated) and the maximum resource time over all fetched parts. If
    /// any part fails, the outcome is empty and carries that part's error.
    pub async fn assemble(&self, main_url: &str) -> FetchedText {
        let mut scheduled: HashSet<String> = HashSet::new();
        scheduled.insert(main_url.to_string());
        let mut resource_time = 0i64;
        let mut parts: Vec<Piece> = vec![Piece::Fetch(main_url.to_string())];

        loop {
            let pending: Vec<usize> = parts
                .iter()
                .enumerate()
                .filter_map(|(index, piece)| matches!(piece, Piece::Fetch(_)).then_some(index))
                .collect();
            if pending.is_empty() {
                break;
            }

            let fetches = pending.iter().map(|&index| {
                let Piece::Fetch(url) = &parts[index] else {
                    unreachable!("pending indexes point at fetch pieces");
                };
                self.fetcher.fetch_text(url)
            });
            let results = join_all(fetches).await;

            for (&index, result) in pending.iter().zip(results) {
                if let Some(error) = result.error {
                    return FetchedText {
                        url: main_url.to_string(),
                        status: result.status,
                        error: Some(error),
                        ..FetchedText::default()
                    };
                }
                resource_time = resource_time.max(result.resource_time);
                parts[index] = Piece::Resolved(result);
            }

            // A lone diff-updatable list manages its own composition; leave
            // its includes unexpanded.
            if parts.len() == 1
                && matches!(&parts[0], Piece::Resolved(fetched) if is_diff_updatable(&fetched.content))
            {
                if let Some(Piece::Resolved(fetched)) = parts.pop() {
                    parts.push(Piece::Text(fetched.content));
                }
                continue;
            }

            let mut expanded: Vec<Piece> = Vec::with_capacity(parts.len());
            for piece in parts {
                match piece {
                    Piece::Resolved(fetched) => {
                        self.expand(fetched, &mut expanded, &mut scheduled);
                    }
                    other => expanded.push(other),
                }
            }
            parts = expanded;
        }

        let mut content = String::new();
        for piece in parts {
            if let Piece::Text(text) = piece {
                content.push_str(&text);
            }
        }
        if !content.ends_with('\n') {
            content.push('\n');
        }

        FetchedText {
            url: main_url.to_string(),
            content,
            resource_time,
            status: None,
            error: None,
        }
    }

    fn expand(&self, fetched: FetchedText, out: &mut Vec<Piece>, scheduled: &mut HashSet<String>) {
        let FetchedText { url, content, .. } = fetched;
        for (range, active) in self.preparser.split(&content) {
            let slice = &content[range];
            if active {
                self.expand_active_slice(slice, &url, out, scheduled);
            } else {
                out.push(Piece::Text(slice.to_string()));
            }
        }
    }

    fn expand_active_slice(
        &self,
        slice: &str,
        parent_url: &str,
        out: &mut Vec<Piece>,
        scheduled: &mut HashSet<String>,
    ) {
        let mut cursor = 0usize;
        for caps in RE_INCLUDE.captures_iter(slice) {
            let Some(whole) = caps.get(0) else { continue };
            let path = &caps[1];
            if Url::parse(path).is_ok() {
                // Absolute URLs are not honored; the directive stays verbatim.
                continue;
            }
            if path.contains("..") {
                // Path traversal guard.
                continue;
            }
            let Some(sub_url) = resolve_relative(parent_url, path) else {
                continue;
            };
            if !scheduled.insert(sub_url.clone()) {
                continue;
            }

            let line_end = slice[whole.end()..]
                .find('\n')
                .map(|offset| whole.end() + offset + 1)
                .unwrap_or(slice.len());
            let mut head = slice[cursor..line_end].to_string();
            if !head.ends_with('\n') {
                head.push('\n');
            }
            out.push(Piece::Text(head));
            out.push(Piece::Text(format!("! >>>>>>>> {sub_url}\n")));
            out.push(Piece::Fetch(sub_url.clone()));
            out.push(Piece::Text(format!("! <<<<<<<< {sub_url}\n")));
            cursor = line_end;
        }
        if cursor < slice.len() {
            out.push(Piece::Text(slice[cursor..].to_string()));
        }
    }
}

fn resolve_relative(parent_url: &str, path: &str) -> Option<String> {
    if let Ok(base) = Url::parse(parent_url) {
        return base.join(path).ok().map(String::from);
    }
    // Local parent: everything up to and including the last slash is the
    // directory the path resolves against.
    let dir_end = parent_url.rfind('/').map(|index| index + 1).unwrap_or(0);
    Some(format!("{}{}", &parent_url[..dir_end], path))
}
