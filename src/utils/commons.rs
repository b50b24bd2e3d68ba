use std::str::FromStr;

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

/// Naive layouts seen in shard rows and older published views, all read as UTC.
const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Values above this are treated as epoch milliseconds rather than seconds.
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// Parses a timestamp from any of the representations the pipeline has ever written.
///
/// Accepts RFC 3339 (any offset), naive ISO with `T` or a space (optionally fractional),
/// `%z` style offsets, and bare epoch seconds or milliseconds. The result is truncated
/// to whole seconds. Returns `None` rather than an error so callers can drop a single row.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return truncate_to_second(parsed.with_timezone(&Utc));
    }

    if let Ok(parsed) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return truncate_to_second(parsed.with_timezone(&Utc));
    }

    for format in NAIVE_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, format) {
            return truncate_to_second(parsed.and_utc());
        }
    }

    if let Ok(epoch) = raw.parse::<i64>() {
        return from_epoch(epoch);
    }

    if let Ok(epoch) = raw.parse::<f64>() {
        if epoch.is_finite() {
            return from_epoch(epoch.trunc() as i64);
        }
    }

    None
}

/// Same as [`parse_timestamp`] but for a JSON value, which may be a string or an epoch number.
pub fn parse_timestamp_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp(s),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
            .and_then(from_epoch),
        _ => None,
    }
}

fn from_epoch(epoch: i64) -> Option<DateTime<Utc>> {
    if epoch.unsigned_abs() >= EPOCH_MILLIS_THRESHOLD as u64 {
        DateTime::from_timestamp(epoch.div_euclid(1000), 0)
    } else {
        DateTime::from_timestamp(epoch, 0)
    }
}

fn truncate_to_second(ts: DateTime<Utc>) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts.timestamp(), 0)
}

/// Canonical wire format for every timestamp the pipeline publishes.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Maps NaN and ±Infinity to `None` so they serialize as `null`.
pub fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

/// Reads an environment variable, falling back to `default` when unset or empty.
pub fn env_or<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow!("Invalid value for {}: {}", key, e)),
        _ => Ok(default),
    }
}

/// Reads an optional environment variable, treating empty values as unset.
pub fn env_opt<T: FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow!("Invalid value for {}: {}", key, e)),
        _ => Ok(None),
    }
}

/// `true`, `1`, `yes` (any case) are truthy; anything else, including unset, uses `default`.
pub fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            matches!(raw.trim().to_lowercase().as_str(), "true" | "1" | "yes")
        }
        _ => default,
    }
}

/// Splits a comma separated list, dropping blanks.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
