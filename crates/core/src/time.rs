use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{PagetraceError, Result};

pub fn parse_duration_str(input: &str) -> Result<Duration> {
    humantime::parse_duration(input)
        .map_err(|e| PagetraceError::Parse(format!("invalid duration {input}: {e}")))
}

/// Unix timestamp in fractional seconds, the unit every span timestamp uses.
pub fn unix_seconds(ts: DateTime<Utc>) -> f64 {
    ts.timestamp_micros() as f64 / 1_000_000.0
}

pub fn datetime_from_seconds(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    DateTime::from_timestamp_micros((secs * 1_000_000.0).round() as i64)
}
