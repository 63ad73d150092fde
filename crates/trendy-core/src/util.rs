//! Small helpers for text cleanup and millisecond timestamps.

use chrono::{DateTime, TimeZone, Utc};

const ERROR_TEXT_LIMIT: usize = 180;

/// Trim optional user or config text, mapping blank values to `None`.
pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|trimmed| !trimmed.is_empty())
        .map(ToOwned::to_owned)
}

pub fn is_http_url(value: &str) -> bool {
    ["http://", "https://"]
        .iter()
        .any(|scheme| value.starts_with(scheme))
}

/// Shorten a server response body before it lands in a mutation's `last_error`.
pub fn compact_text(value: &str) -> String {
    value.trim().chars().take(ERROR_TEXT_LIMIT).collect()
}

pub fn to_millis(value: &DateTime<Utc>) -> i64 {
    value.timestamp_millis()
}

/// Out-of-range values clamp to the Unix epoch instead of failing the row.
pub fn from_millis(value: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(value)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// A difference exactly equal to the tolerance counts as a match.
pub fn within_tolerance(a: &DateTime<Utc>, b: &DateTime<Utc>, tolerance_ms: i64) -> bool {
    (a.timestamp_millis() - b.timestamp_millis()).abs() <= tolerance_ms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_text_becomes_none() {
        assert_eq!(normalize_text_option(None), None);
        assert_eq!(normalize_text_option(Some(" \t ".to_string())), None);
        assert_eq!(
            normalize_text_option(Some("  Gym ".to_string())),
            Some("Gym".to_string())
        );
    }

    #[test]
    fn only_http_schemes_are_urls() {
        assert!(is_http_url("https://api.trendy.test"));
        assert!(is_http_url("http://127.0.0.1:8080"));
        assert!(!is_http_url("ws://api.trendy.test"));
        assert!(!is_http_url("api.trendy.test"));
    }

    #[test]
    fn compact_text_caps_length() {
        let long = "x".repeat(500);
        assert_eq!(compact_text(&long).len(), ERROR_TEXT_LIMIT);
        assert_eq!(compact_text("  short \n"), "short");
    }

    #[test]
    fn tolerance_includes_boundary() {
        let a = from_millis(1_700_000_000_000);
        let b = from_millis(1_700_000_001_000);
        assert!(within_tolerance(&a, &b, 1_000));
        assert!(!within_tolerance(&a, &from_millis(1_700_000_001_001), 1_000));
    }

    #[test]
    fn millis_keep_precision() {
        let value = from_millis(1_700_000_000_123);
        assert_eq!(to_millis(&value), 1_700_000_000_123);
    }
}
