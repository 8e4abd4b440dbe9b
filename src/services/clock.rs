//! Timebase: the single source of "now" in the configured zone.
//!
//! All timestamps the core reads, writes, or schedules against are naive
//! wall-clock instants produced here. No other component calls the OS clock,
//! which lets tests substitute the time source.

use chrono::{DateTime, FixedOffset, NaiveDateTime, Timelike, Utc};
use std::sync::Arc;

/// Source of the current UTC instant. Production uses the OS clock; tests
/// substitute a manual source.
pub trait TimeSource: Send + Sync {
    fn utc_now(&self) -> DateTime<Utc>;
}

struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall clock pinned to a fixed zone offset.
#[derive(Clone)]
pub struct Clock {
    offset: FixedOffset,
    source: Arc<dyn TimeSource>,
}

impl Clock {
    /// Clock for the given zone name, reading the OS clock.
    pub fn new(timezone: &str) -> Self {
        Self::with_source(timezone, Arc::new(SystemTimeSource))
    }

    /// Clock for the given zone name with a substituted time source.
    pub fn with_source(timezone: &str, source: Arc<dyn TimeSource>) -> Self {
        let secs = parse_utc_offset_secs(timezone);
        let offset = FixedOffset::east_opt(secs as i32)
            .unwrap_or_else(|| FixedOffset::east_opt(0).unwrap());
        Self { offset, source }
    }

    /// Current wall-clock instant in the configured zone.
    pub fn now(&self) -> NaiveDateTime {
        self.source.utc_now().with_timezone(&self.offset).naive_local()
    }
}

/// Drop sub-second precision. Firing instants are keyed at one-second
/// resolution.
pub fn floor_to_second(instant: NaiveDateTime) -> NaiveDateTime {
    instant.with_nanosecond(0).unwrap_or(instant)
}

/// Parse a timezone name into a UTC offset in seconds.
///
/// Supports:
///   - `"UTC"` / `"GMT"` → 0
///   - Fixed offsets: `"+05:30"`, `"-08:00"`, `"+0530"`, `"-0800"`
///   - Common IANA names and abbreviations as best-effort fixed offsets
///     (DST-observing zones resolve to their standard offset)
///
/// Falls back to 0 (UTC) for unrecognized values.
fn parse_utc_offset_secs(tz: &str) -> i64 {
    let tz = tz.trim();

    if tz.eq_ignore_ascii_case("UTC") || tz.eq_ignore_ascii_case("GMT") {
        return 0;
    }

    // Try parsing fixed offset like "+05:30", "-08:00", "+0530", "-0800"
    if tz.starts_with('+') || tz.starts_with('-') {
        let sign: i64 = if tz.starts_with('-') { -1 } else { 1 };
        let digits = &tz[1..];
        let (hours, minutes) = if digits.contains(':') {
            let parts: Vec<&str> = digits.split(':').collect();
            if parts.len() == 2 {
                (
                    parts[0].parse::<i64>().unwrap_or(0),
                    parts[1].parse::<i64>().unwrap_or(0),
                )
            } else {
                return 0;
            }
        } else if digits.len() == 4 {
            (
                digits[..2].parse::<i64>().unwrap_or(0),
                digits[2..].parse::<i64>().unwrap_or(0),
            )
        } else {
            return 0;
        };
        return sign * (hours * 3600 + minutes * 60);
    }

    // Common IANA names and abbreviations (best-effort).
    match tz {
        "Asia/Kolkata" | "Asia/Calcutta" | "IST" => 5 * 3600 + 1800,
        "Asia/Tokyo" | "JST" => 9 * 3600,
        "Asia/Shanghai" | "Asia/Singapore" => 8 * 3600,
        "Asia/Dubai" => 4 * 3600,
        "Europe/London" => 0,
        "Europe/Paris" | "Europe/Berlin" | "CET" => 3600,
        "Europe/Moscow" => 3 * 3600,
        "America/New_York" | "EST" => -5 * 3600,
        "America/Chicago" | "CST" => -6 * 3600,
        "America/Denver" | "MST" => -7 * 3600,
        "America/Los_Angeles" | "PST" => -8 * 3600,
        "Australia/Sydney" | "AEST" => 10 * 3600,
        _ => {
            tracing::warn!("Unrecognized timezone '{}', defaulting to UTC", tz);
            0
        }
    }
}
