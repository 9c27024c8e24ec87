//! Fixed-width wall-clock timestamp codec.
//!
//! Latency probes and log events carry a `HH:MM:SS.mmm` time-of-day
//! stamp with no date attached. Delays are computed as the signed
//! difference of two millis-since-midnight values, so a probe that
//! straddles local midnight (or a DST shift) produces a negative or
//! wildly large delta. That is a known limitation of the format, left
//! uncorrected.

use chrono::{Local, NaiveTime, Timelike};

/// chrono format string for the wire/log timestamp.
pub const TIME_FORMAT: &str = "%H:%M:%S%.3f";

/// Length of a formatted stamp: `HH:MM:SS.mmm`.
pub const STAMP_LEN: usize = 12;

/// Format the current local time of day as `HH:MM:SS.mmm`.
pub fn now_stamp() -> String {
    Local::now().time().format(TIME_FORMAT).to_string()
}

/// Milliseconds elapsed since local midnight, right now.
pub fn now_millis_of_day() -> i64 {
    millis_of_day(Local::now().time())
}

/// Milliseconds since midnight for a given time of day.
pub fn millis_of_day(t: NaiveTime) -> i64 {
    i64::from(t.num_seconds_from_midnight()) * 1000 + i64::from(t.nanosecond() / 1_000_000)
}

/// Check whether a line starts with the structural shape of a stamp:
/// `DD:DD:DD.DDD`. This only checks digit/separator positions; values
/// like `99:99:99.999` pass here and are rejected by [`parse_stamp`].
pub fn has_stamp_prefix(line: &str) -> bool {
    let bytes = line.as_bytes();
    if bytes.len() < STAMP_LEN {
        return false;
    }
    for (i, &b) in bytes[..STAMP_LEN].iter().enumerate() {
        let ok = match i {
            2 | 5 => b == b':',
            8 => b == b'.',
            _ => b.is_ascii_digit(),
        };
        if !ok {
            return false;
        }
    }
    true
}

/// Parse a `HH:MM:SS.mmm` stamp into milliseconds since midnight.
pub fn parse_stamp(s: &str) -> Result<i64, chrono::ParseError> {
    NaiveTime::parse_from_str(s, TIME_FORMAT).map(millis_of_day)
}
