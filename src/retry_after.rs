// src/retry_after.rs
//! `Retry-After` header parsing.
//!
//! The header carries either a number of seconds or an HTTP-date. A zero
//! duration means the server gave no usable directive and the caller should
//! fall back to its own backoff.

use chrono::{DateTime, NaiveDateTime, Utc, Weekday};
use std::time::Duration;

/// IMF-fixdate, the preferred HTTP-date format.
pub const IMF_FIXDATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

// Accepted layouts once the leading weekday is removed. The weekday is only
// checked for being a day name, never against the date.
const IMF_FIXDATE_TAIL: &str = "%d %b %Y %H:%M:%S GMT";
const RFC850_TAIL: &str = "%d-%b-%y %H:%M:%S GMT";
const ASCTIME_TAIL: &str = "%b %e %H:%M:%S %Y";

/// Parse a `Retry-After` value relative to `now`.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Duration {
    if value.is_empty() {
        return Duration::ZERO;
    }

    if let Ok(seconds) = value.parse::<i64>() {
        return if seconds > 0 {
            Duration::from_secs(seconds as u64)
        } else {
            Duration::ZERO
        };
    }

    match parse_http_date(value) {
        Some(at) => {
            let seconds = (at - now).num_seconds();
            if seconds > 0 {
                Duration::from_secs(seconds as u64)
            } else {
                Duration::ZERO
            }
        }
        None => Duration::ZERO,
    }
}

/// Parse any of the three date formats HTTP/1.1 recipients must accept.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    let (weekday, rest) = match value.split_once(',') {
        Some((weekday, rest)) => (weekday, rest.trim_start()),
        None => value.split_once(' ')?,
    };
    weekday.parse::<Weekday>().ok()?;

    [IMF_FIXDATE_TAIL, RFC850_TAIL, ASCTIME_TAIL]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(rest, format).ok())
        .map(|naive| naive.and_utc())
}

/// Render `at` as an IMF-fixdate.
pub fn format_http_date(at: DateTime<Utc>) -> String {
    at.format(IMF_FIXDATE).to_string()
}
