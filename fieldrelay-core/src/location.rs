//! Telemetry grammar: `longitude|latitude|altitude;` lines into validated location records.
//! Most-recent-wins: only the latest valid record is retained.

use std::time::{Duration, SystemTime};

use crate::error::TelemetryError;

/// Exclusive bound for longitude and latitude.
pub const LAT_LNG_LIMIT: f64 = 180.000_000_05;

/// Exclusive bound for altitude.
pub const ALTITUDE_LIMIT: f64 = 180_000.000_05;

pub fn is_valid_lat_lng(v: f64) -> bool {
    v > -LAT_LNG_LIMIT && v < LAT_LNG_LIMIT
}

pub fn is_valid_altitude(v: f64) -> bool {
    v > -ALTITUDE_LIMIT && v < ALTITUDE_LIMIT
}

/// One parsed telemetry line. `valid` is false when any field is out of range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationRecord {
    pub longitude: f64,
    pub latitude: f64,
    pub altitude: f64,
    pub valid: bool,
    /// Wall-clock time the line was parsed.
    pub captured_at: SystemTime,
}

impl LocationRecord {
    pub fn new(longitude: f64, latitude: f64, altitude: f64) -> Self {
        Self {
            longitude,
            latitude,
            altitude,
            valid: is_valid_lat_lng(longitude)
                && is_valid_lat_lng(latitude)
                && is_valid_altitude(altitude),
            captured_at: SystemTime::now(),
        }
    }

    /// Age relative to now. Clock going backwards counts as zero age.
    pub fn age(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.captured_at)
            .unwrap_or(Duration::ZERO)
    }

    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.age() > max_age
    }
}

/// Parse one telemetry line. Returns `None` when the line does not match the grammar.
/// Out-of-range values still produce a record, with `valid == false`.
pub fn parse_line(text: &str) -> Option<LocationRecord> {
    let body = text.trim().strip_suffix(';')?;
    let mut fields = body.split('|');
    let longitude = parse_decimal(fields.next()?)?;
    let latitude = parse_decimal(fields.next()?)?;
    let altitude = parse_decimal(fields.next()?)?;
    if fields.next().is_some() {
        return None;
    }
    Some(LocationRecord::new(longitude, latitude, altitude))
}

/// `[+-]?digits(.digits)?`; rejects exponents, `inf` and `NaN` which `f64::from_str` would accept.
fn parse_decimal(field: &str) -> Option<f64> {
    let unsigned = field
        .strip_prefix('-')
        .or_else(|| field.strip_prefix('+'))
        .unwrap_or(field);
    let (int, frac) = match unsigned.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (unsigned, None),
    };
    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(int) || !frac.map_or(true, all_digits) {
        return None;
    }
    field.parse().ok()
}

/// Last non-empty line of a buffer; earlier lines are stale.
pub fn latest_line(content: &str) -> Option<&str> {
    content.lines().rev().find(|l| !l.trim().is_empty())
}

/// Retains the most recent valid record. Invalid or malformed input never overwrites it.
#[derive(Debug, Default, Clone)]
pub struct LocationState {
    latest: Option<LocationRecord>,
}

impl LocationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<&LocationRecord> {
        self.latest.as_ref()
    }

    /// Apply one line. On success the new record is retained and returned.
    pub fn apply(&mut self, line: &str) -> Result<LocationRecord, TelemetryError> {
        let record =
            parse_line(line).ok_or_else(|| TelemetryError::Grammar(line.trim().to_string()))?;
        if !record.valid {
            return Err(TelemetryError::OutOfRange {
                longitude: record.longitude,
                latitude: record.latitude,
                altitude: record.altitude,
            });
        }
        self.latest = Some(record);
        Ok(record)
    }
}
