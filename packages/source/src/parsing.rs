//! Shared parsing utilities for catalog payloads and raw tables.
//!
//! Timestamp coercion for downloaded CSV cells, and lenient decoding of the
//! loosely-typed values the datastore returns (numbers sometimes arrive as
//! strings, text sometimes as numbers or `null`).

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

/// Naive datetime layouts accepted for creation timestamps.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Parses a creation timestamp into a UTC instant.
///
/// Accepts RFC 3339 (with offset), naive ISO-like datetimes, and bare dates.
/// Naive values are taken to be UTC. Returns `None` for anything else.
#[must_use]
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Parses a calendar day from a datastore value such as `"2024-01-01"` or
/// `"2024-01-01T00:00:00"`.
#[must_use]
pub fn parse_day(value: &serde_json::Value) -> Option<NaiveDate> {
    let s = value.as_str()?.trim();
    let date_part = s.get(..10)?;
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

/// Reads an integer that may be a JSON number or a numeric string.
#[must_use]
pub fn json_i64(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(f64_to_i64)),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Reads a text value, mapping `null`/missing to the empty string and
/// numbers to their decimal form.
#[must_use]
pub fn json_text(value: Option<&serde_json::Value>) -> String {
    match value {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Number(n)) => n.to_string(),
        Some(serde_json::Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

#[allow(clippy::cast_possible_truncation)]
fn f64_to_i64(f: f64) -> i64 {
    f as i64
}
