//! Shared utility functions used across multiple modules.

use std::fmt::Display;
use std::ops::RangeInclusive;
use std::str::FromStr;

/// Normalize optional text by trimming whitespace and removing empties.
///
/// Returns `None` when the input is `None` or the trimmed value is empty.
pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    let value = value?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Check if a string starts with `http://` or `https://`.
pub fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

/// Check if a string is an HTTP(S) or WebSocket URL.
pub fn is_server_url(value: &str) -> bool {
    is_http_url(value) || value.starts_with("ws://") || value.starts_with("wss://")
}

/// Current Unix timestamp in milliseconds.
pub fn unix_millis_now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Parse `raw` (or `default` when absent) and check it lies in `range`.
///
/// The error message names the setting and the accepted range.
pub fn parse_in_range<T>(
    name: &str,
    raw: Option<String>,
    default: T,
    range: RangeInclusive<T>,
) -> Result<T, String>
where
    T: FromStr + PartialOrd + Display + Copy,
{
    let invalid = || {
        format!(
            "{name} must be an integer in [{}, {}]",
            range.start(),
            range.end()
        )
    };
    let value = match normalize_text_option(raw) {
        Some(raw) => raw.parse::<T>().map_err(|_| invalid())?,
        None => default,
    };
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(invalid())
    }
}
