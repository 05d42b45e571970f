//! Shared timestamp helpers.
//!
//! The index stores unix-epoch microseconds (UTC); documents carry RFC 3339.

use chrono::{DateTime, TimeZone, Utc};

pub const MICROS_PER_SEC: i64 = 1_000_000;

pub fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

pub fn secs_to_micros(secs: i64) -> i64 {
    secs.saturating_mul(MICROS_PER_SEC)
}

pub fn micros_to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_micros(ts)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

pub fn to_rfc3339(ts: i64) -> String {
    micros_to_datetime(ts).to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Filesystem-safe compact stamp, e.g. `2026-01-05T14-03-09Z`.
pub fn path_stamp(ts: i64) -> String {
    micros_to_datetime(ts)
        .format("%Y-%m-%dT%H-%M-%SZ")
        .to_string()
}

/// `(YYYY, MM)` directory components for archive paths.
pub fn year_month(ts: i64) -> (String, String) {
    let dt = micros_to_datetime(ts);
    (dt.format("%Y").to_string(), dt.format("%m").to_string())
}
