//! Trace timestamps.
//!
//! Hosts emit ISO-8601 timestamps either with an offset
//! (`2024-06-01T08:30:00+02:00`) or without one (`2024-06-01T08:30:00`).
//! Both are accepted. A naive timestamp is taken at offset zero. Partitioning
//! always uses the wall-clock components as written, never a converted instant.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Offset, SecondsFormat, TimeZone, Utc};

use crate::error::ValidationError;

/// Timestamp type carried by every trace.
pub type Timestamp = DateTime<FixedOffset>;

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"];

/// Parses a host timestamp.
///
/// # Errors
///
/// Returns `ValidationError::InvalidTimestamp` if the value is neither an
/// RFC 3339 timestamp, a naive ISO-8601 date-time, nor a bare date.
pub fn parse_timestamp(value: &str) -> Result<Timestamp, ValidationError> {
    let trimmed = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(ts);
    }

    let naive = NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        });

    match naive {
        Some(naive) => Ok(utc_offset().from_utc_datetime(&naive)),
        None => Err(ValidationError::InvalidTimestamp {
            value: value.to_string(),
        }),
    }
}

/// Current time as a trace timestamp.
#[must_use]
pub fn now() -> Timestamp {
    Utc::now().with_timezone(&utc_offset())
}

/// Formats a timestamp the way it is persisted.
#[must_use]
pub fn format_timestamp(ts: &Timestamp) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, false)
}

fn utc_offset() -> FixedOffset {
    Utc.fix()
}

/// Serde adapter for `Timestamp` fields using `parse_timestamp`.
pub mod serde_ts {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::{format_timestamp, parse_timestamp, Timestamp};

    #[allow(missing_docs)]
    pub fn serialize<S: Serializer>(ts: &Timestamp, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_timestamp(ts))
    }

    #[allow(missing_docs)]
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Timestamp, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_timestamp(&raw).map_err(serde::de::Error::custom)
    }
}
