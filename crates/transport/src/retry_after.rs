use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

pub const RETRY_AFTER_HEADER: &str = "retry-after";

/// Delay requested by a `Retry-After` value: delta seconds, or an HTTP date
/// relative to `now`. A date in the past means no delay; anything else
/// unparseable falls back to `default`.
pub fn parse_retry_after(now: DateTime<Utc>, header: Option<&str>, default: Duration) -> Duration {
    let Some(raw) = header.map(str::trim).filter(|v| !v.is_empty()) else {
        return default;
    };
    if let Ok(secs) = raw.parse::<u64>() {
        return Duration::from_secs(secs);
    }
    match DateTime::parse_from_rfc2822(raw) {
        Ok(date) => (date.with_timezone(&Utc) - now)
            .to_std()
            .unwrap_or(Duration::ZERO),
        Err(error) => {
            debug!(value = raw, error = %error, "unparseable retry-after; using default");
            default
        }
    }
}
