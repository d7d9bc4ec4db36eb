//! Filter-list header extraction.
//!
//! Filter lists carry metadata in comment lines near the top of the file:
//!
//! ```text
//! ! Title: EasyList
//! ! Last-Modified: Mon, 01 Jan 2024 00:00:00 GMT
//! ! Expires: 4 days
//! ! Diff-Path: ../patches/easylist.txt#name:2024.1
//! ```
//!
//! Only the first KiB of content is scanned. Field names are matched
//! case-insensitively with `-` and whitespace interchangeable, behind a `!`
//! or `#` comment marker. Values framed as `%...%` are unresolved template
//! placeholders and are treated as absent.

use std::sync::LazyLock;

use chrono::DateTime;
use regex::Regex;

/// How much of the content is scanned for header fields.
pub const HEADER_WINDOW: usize = 1024;

/// Minimum full-refresh TTL in days.
pub const EXPIRES_FLOOR_DAYS: f64 = 0.5;

/// Minimum differential-refresh TTL in days.
pub const DIFF_EXPIRES_FLOOR_DAYS: f64 = 0.25;

static RE_EXPIRES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s*([dh])?").expect("valid expires pattern"));

fn header_window(content: &str) -> &str {
    if content.len() <= HEADER_WINDOW {
        return content;
    }
    let mut end = HEADER_WINDOW;
    while !content.is_char_boundary(end) {
        end -= 1;
    }
    &content[..end]
}

fn field_pattern(name: &str) -> String {
    let mut pattern = String::from(r"(?im)^(?:!|#)[ \t]*");
    for c in name.chars() {
        match c {
            '-' | ' ' => pattern.push_str(r"[-\s]"),
            _ => {
                let mut buf = [0u8; 4];
                pattern.push_str(&regex::escape(c.encode_utf8(&mut buf)));
            }
        }
    }
    pattern.push_str(r"[ \t]*:[ \t]*(\S[^\n\r]*?)[ \t]*$");
    pattern
}

/// Extracts a header field value from the first KiB of `content`.
///
/// Returns `None` when the field is absent or its value is an unresolved
/// `%...%` template placeholder.
pub fn extract_field(content: &str, name: &str) -> Option<String> {
    let re = Regex::new(&field_pattern(name)).ok()?;
    let caps = re.captures(header_window(content))?;
    let value = caps.get(1)?.as_str();
    if value.starts_with('%') && value.ends_with('%') {
        return None;
    }
    Some(value.to_string())
}

/// Parses a `Last-Modified` value into epoch milliseconds, `0` on failure.
pub fn parse_last_modified(value: &str) -> i64 {
    DateTime::parse_from_rfc2822(value)
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(0)
}

/// Parses an `Expires`-style value into days, `0` on failure.
///
/// The grammar is `(\d+)\s*([dh])?` with days as the default unit. Hours are
/// quantized to quarter days via `ceil(h/6)/4`. Successful parses are clamped
/// to `floor_days`.
pub fn parse_expires(value: &str, floor_days: f64) -> f64 {
    let Some(caps) = RE_EXPIRES.captures(value) else {
        return 0.0;
    };
    let n: f64 = match caps[1].parse() {
        Ok(n) => n,
        Err(_) => return 0.0,
    };
    let days = match caps.get(2).map(|m| m.as_str()) {
        Some("h") => (n / 6.0).ceil() / 4.0,
        _ => n,
    };
    if days <= 0.0 { 0.0 } else { days.max(floor_days) }
}

/// Parsed header fields relevant to caching and refresh scheduling.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListHeader {
    /// Origin timestamp in epoch milliseconds, `0` when absent or unparsable.
    pub last_modified: i64,
    /// Full-refresh TTL in days, `0` when absent.
    pub expires_days: f64,
    /// Differential-refresh TTL in days, `0` when absent.
    pub diff_expires_days: f64,
    /// Identity of the diff bundle this list belongs to.
    pub diff_name: Option<String>,
    /// Path of the patch resource for differential updates.
    pub diff_path: Option<String>,
}

/// Parses the known scheduling fields out of a list header.
pub fn parse_list_header(content: &str) -> ListHeader {
    ListHeader {
        last_modified: extract_field(content, "Last-Modified")
            .map(|v| parse_last_modified(&v))
            .unwrap_or(0),
        expires_days: extract_field(content, "Expires")
            .map(|v| parse_expires(&v, EXPIRES_FLOOR_DAYS))
            .unwrap_or(0.0),
        diff_expires_days: extract_field(content, "Diff-Expires")
            .map(|v| parse_expires(&v, DIFF_EXPIRES_FLOOR_DAYS))
            .unwrap_or(0.0),
        diff_name: extract_field(content, "Diff-Name"),
        diff_path: extract_field(content, "Diff-Path"),
    }
}

/// `true` when the content declares a usable (non-template) `Diff-Path`.
pub fn is_diff_updatable(content: &str) -> bool {
    extract_field(content, "Diff-Path").is_some()
}
