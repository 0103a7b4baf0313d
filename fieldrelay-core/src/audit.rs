//! Audit line format: `<YYYY-mm-dd HH:MM:SS>: <message>\n`.

use chrono::{DateTime, Local, TimeZone};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn format_entry<Tz: TimeZone>(at: &DateTime<Tz>, message: &str) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("{}: {}\n", at.format(TIMESTAMP_FORMAT), message)
}

/// Format an entry stamped with the local time.
pub fn format_now(message: &str) -> String {
    format_entry(&Local::now(), message)
}
