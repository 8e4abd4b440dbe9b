//! Firing-time computation for interval and cron rules.
//!
//! Pure functions from (schedule definition, reference instant) to the next
//! firing instant. Holds no state and no references to live timers.

use std::str::FromStr;

use chrono::{Duration, NaiveDateTime, TimeZone, Utc};
use cron::Schedule as CronSchedule;

use crate::error::{AppError, Result};
use crate::models::{Schedule, ScheduleType};

/// The initial firing instant for a schedule that has never fired.
///
/// Interval rules fire at `start_at` itself (k = 0 of the series); cron
/// rules have no initial instant and always go through [`next_fire`].
/// Whether a late initial firing is still admissible is the caller's
/// misfire-grace decision.
pub fn initial_fire(schedule: &Schedule) -> Option<NaiveDateTime> {
    if schedule.schedule_type == ScheduleType::Interval && schedule.runs_count == 0 {
        Some(schedule.start_at)
    } else {
        None
    }
}

/// Compute the next firing instant strictly after `after`, or `None` when
/// the schedule's window has closed (duration elapsed or run budget spent).
pub fn next_fire(schedule: &Schedule, after: NaiveDateTime) -> Option<NaiveDateTime> {
    if let Some(max) = schedule.max_runs {
        if schedule.runs_count >= max {
            return None;
        }
    }

    let candidate = match schedule.schedule_type {
        ScheduleType::Interval => {
            let interval = i64::from(schedule.interval_seconds?);
            next_interval_fire(schedule.start_at, interval, after)
        }
        ScheduleType::Cron => {
            let expr = schedule.cron_expression.as_deref()?;
            next_cron_fire(expr, schedule.start_at.max(after))?
        }
    };

    if let Some(end) = schedule.window_end() {
        if candidate > end {
            return None;
        }
    }

    Some(candidate)
}

/// First instant of the arithmetic series `start_at + k·interval` strictly
/// after `after`; `start_at` itself when `after` precedes it.
fn next_interval_fire(start_at: NaiveDateTime, interval_seconds: i64, after: NaiveDateTime) -> NaiveDateTime {
    if after < start_at {
        return start_at;
    }
    let elapsed = (after - start_at).num_seconds();
    let k = elapsed / interval_seconds + 1;
    start_at + Duration::seconds(k * interval_seconds)
}

/// Next cron match strictly after `base`.
///
/// The configured zone is a fixed offset, so evaluating the naive instant as
/// if it were UTC is exact.
fn next_cron_fire(expr: &str, base: NaiveDateTime) -> Option<NaiveDateTime> {
    let schedule = parse_cron(expr).ok()?;
    let base_utc = Utc.from_utc_datetime(&base);
    schedule
        .after(&base_utc)
        .map(|dt| dt.naive_utc())
        .find(|&candidate| candidate > base)
}

/// Parse and validate a five-field cron expression.
///
/// The cron crate wants a seconds field, so `*/5 * * * *` is evaluated as
/// `0 */5 * * * *`: firings land on second zero of matching minutes.
pub fn parse_cron(expr: &str) -> Result<CronSchedule> {
    if expr.split_whitespace().count() != 5 {
        return Err(AppError::Validation(format!(
            "Cron expression must have 5 fields: '{expr}'"
        )));
    }
    let normalized = format!("0 {expr}");
    CronSchedule::from_str(&normalized)
        .map_err(|e| AppError::Validation(format!("Invalid cron expression '{expr}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ScheduleStatus, ScheduleType};
    use chrono::NaiveDate;
    use uuid::Uuid;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn interval_schedule(start: NaiveDateTime, interval: i32) -> Schedule {
        Schedule {
            id: Uuid::new_v4(),
            name: "test".into(),
            target_id: Uuid::new_v4(),
            schedule_type: ScheduleType::Interval,
            interval_seconds: Some(interval),
            cron_expression: None,
            start_at: start,
            duration_seconds: None,
            max_runs: None,
            status: ScheduleStatus::Active,
            runs_count: 0,
            last_run_at: None,
            next_run_at: None,
            created_at: start,
            updated_at: start,
        }
    }

    fn cron_schedule(start: NaiveDateTime, expr: &str) -> Schedule {
        Schedule {
            schedule_type: ScheduleType::Cron,
            interval_seconds: None,
            cron_expression: Some(expr.into()),
            ..interval_schedule(start, 1)
        }
    }

    #[test]
    fn test_interval_before_start_returns_start() {
        let s = interval_schedule(at(12, 0, 0), 10);
        assert_eq!(next_fire(&s, at(11, 59, 0)), Some(at(12, 0, 0)));
    }

    #[test]
    fn test_initial_fire_only_for_unfired_interval() {
        let mut s = interval_schedule(at(12, 0, 0), 10);
        assert_eq!(initial_fire(&s), Some(at(12, 0, 0)));
        s.runs_count = 1;
        assert_eq!(initial_fire(&s), None);

        let c = cron_schedule(at(12, 0, 0), "*/5 * * * *");
        assert_eq!(initial_fire(&c), None);
    }

    #[test]
    fn test_interval_strictly_after() {
        let s = interval_schedule(at(12, 0, 0), 10);
        // Exactly on a firing instant: the next one is returned.
        assert_eq!(next_fire(&s, at(12, 0, 0)), Some(at(12, 0, 10)));
        assert_eq!(next_fire(&s, at(12, 0, 10)), Some(at(12, 0, 20)));
        // In between firing instants.
        assert_eq!(next_fire(&s, at(12, 0, 13)), Some(at(12, 0, 20)));
    }

    #[test]
    fn test_interval_duration_window_closes() {
        let mut s = interval_schedule(at(12, 0, 0), 10);
        s.duration_seconds = Some(35);
        // Firings at +0, +10, +20, +30; +40 is past the window.
        assert_eq!(next_fire(&s, at(12, 0, 25)), Some(at(12, 0, 30)));
        assert_eq!(next_fire(&s, at(12, 0, 30)), None);
    }

    #[test]
    fn test_max_runs_window_closes() {
        let mut s = interval_schedule(at(12, 0, 0), 10);
        s.max_runs = Some(2);
        s.runs_count = 1;
        assert!(next_fire(&s, at(12, 0, 15)).is_some());
        s.runs_count = 2;
        assert_eq!(next_fire(&s, at(12, 0, 15)), None);
    }

    #[test]
    fn test_cron_every_five_minutes() {
        let s = cron_schedule(at(12, 0, 0), "*/5 * * * *");
        // Strictly greater than max(after, start_at): 12:00:00 itself is skipped.
        assert_eq!(next_fire(&s, at(12, 0, 0)), Some(at(12, 5, 0)));
        assert_eq!(next_fire(&s, at(12, 5, 0)), Some(at(12, 10, 0)));
        assert_eq!(next_fire(&s, at(12, 7, 30)), Some(at(12, 10, 0)));
    }

    #[test]
    fn test_cron_respects_start_at() {
        let s = cron_schedule(at(12, 30, 0), "*/5 * * * *");
        // `after` precedes start_at: evaluation starts from start_at.
        assert_eq!(next_fire(&s, at(11, 0, 0)), Some(at(12, 35, 0)));
    }

    #[test]
    fn test_cron_max_runs() {
        let mut s = cron_schedule(at(12, 0, 0), "*/5 * * * *");
        s.max_runs = Some(2);
        s.runs_count = 2;
        assert_eq!(next_fire(&s, at(12, 10, 0)), None);
    }

    #[test]
    fn test_parse_cron_rejects_bad_expressions() {
        assert!(parse_cron("*/5 * * * *").is_ok());
        assert!(parse_cron("0 9-17 * * 1-5").is_ok());
        assert!(parse_cron("invalid").is_err());
        assert!(parse_cron("* * *").is_err());
        assert!(parse_cron("61 * * * *").is_err());
        // Six fields is not the supported form.
        assert!(parse_cron("0 * * * * *").is_err());
    }
}
