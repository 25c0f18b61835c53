//! Privacy helpers applied while normalizing observations.
//!
//! Page telemetry routinely carries data that must never reach the
//! collector: session tokens in query strings, credentials embedded in URLs,
//! authorization headers, or megabytes of console output. Every observation
//! passes through these helpers before it is queued.
//!
//! # Guarantees
//!
//! - **URL redaction**: query strings are removed except for explicitly
//!   allowlisted parameters; fragments and userinfo are always removed.
//! - **Header allowlist**: only [`SAFE_HEADERS`] survive.
//! - **Bounded messages**: console messages are cut at
//!   [`MAX_CONSOLE_MESSAGE_CHARS`] characters.
//!
//! # Example
//!
//! ```
//! use threatguard_agent::privacy::redact_url;
//!
//! let redacted = redact_url("https://bank.example/login?token=s3cr3t&lang=en#top", &["lang"]);
//! assert_eq!(redacted, "https://bank.example/login?lang=en");
//! ```

use reqwest::Url;
use serde_json::{Map, Value};
use tracing::debug;

/// Maximum number of characters kept from a console message.
pub const MAX_CONSOLE_MESSAGE_CHARS: usize = 5000;

/// Request headers that may be forwarded (compared case-insensitively).
pub const SAFE_HEADERS: &[&str] = &["content-type", "accept", "referer", "user-agent"];

/// Strips the query string (except `allowlist` parameters), fragment and
/// userinfo from `raw`.
///
/// Unparseable input is returned unchanged, since relative or malformed URLs
/// carry no query parameters the parser could identify.
#[must_use]
pub fn redact_url(raw: &str, allowlist: &[&str]) -> String {
    let url = match Url::parse(raw) {
        Ok(url) => url,
        Err(e) => {
            debug!(error = %e, "URL not parseable, leaving as-is");
            return raw.to_string();
        }
    };

    let kept: Vec<(String, String)> = allowlist
        .iter()
        .filter_map(|key| {
            url.query_pairs()
                .find(|(name, value)| name == key && !value.is_empty())
                .map(|(name, value)| (name.into_owned(), value.into_owned()))
        })
        .collect();

    let mut redacted = url;
    redacted.set_fragment(None);
    redacted.set_query(None);
    // Fails only for URLs that cannot carry credentials in the first place
    let _ = redacted.set_username("");
    let _ = redacted.set_password(None);

    if !kept.is_empty() {
        redacted.query_pairs_mut().extend_pairs(kept);
    }

    redacted.to_string()
}

/// Keeps only the [`SAFE_HEADERS`] of a header map, lowercasing names.
#[must_use]
pub fn allowlist_headers(headers: &Map<String, Value>) -> Map<String, Value> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let lower = name.to_ascii_lowercase();
            SAFE_HEADERS
                .contains(&lower.as_str())
                .then(|| (lower, value.clone()))
        })
        .collect()
}

/// Truncates `text` to at most `max_chars` characters.
#[must_use]
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}
