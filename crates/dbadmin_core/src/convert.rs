//! Small value conversions for building statements.

use chrono::{DateTime, TimeZone};
use std::fmt::Display;

/// Timestamp layout accepted by `DATETIME`/`TIMESTAMP` columns.
pub const DATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Format a timestamp as `YYYY-MM-DD HH:MM:SS` in its own time zone.
pub fn format_date_time<Tz>(ts: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    ts.format(DATE_TIME_FORMAT).to_string()
}

/// Store a flag in an integer column.
pub fn bool_to_int(b: bool) -> i32 {
    i32::from(b)
}

/// Read a flag back from an integer column; any non-zero value is true.
pub fn int_to_bool(i: i32) -> bool {
    i != 0
}
