//! Cron expression evaluator for recurring job templates (PRD-22).
//!
//! Supports the classic five-field form `MIN HOUR DOM MON DOW`. Each field
//! accepts `*`, `*/N`, a comma-separated list, or an exact integer. Weekday
//! `0` is Sunday. Resolution is one minute; the next-run search is bounded
//! to one year ahead and returns `None` beyond that.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};

use crate::error::CoreError;
use crate::types::Timestamp;

/// Upper bound for the next-run search, in days.
const SEARCH_HORIZON_DAYS: i64 = 366;

// ---------------------------------------------------------------------------
// CronSchedule
// ---------------------------------------------------------------------------

/// A parsed five-field cron expression.
///
/// Field values are pre-expanded into sorted match lists, so evaluation is a
/// containment check per field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days_of_month: Vec<u32>,
    months: Vec<u32>,
    /// 0 = Sunday .. 6 = Saturday.
    days_of_week: Vec<u32>,
}

impl CronSchedule {
    /// Parse a cron expression, validating all five fields.
    pub fn parse(expression: &str) -> Result<Self, CoreError> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(CoreError::Validation(format!(
                "Invalid cron expression '{expression}': expected 5 fields (MIN HOUR DOM MON DOW), got {}",
                parts.len()
            )));
        }

        let field = |spec: &str, name: &str, min: u32, max: u32| {
            parse_field(spec, min, max).ok_or_else(|| {
                CoreError::Validation(format!(
                    "Invalid cron expression '{expression}': bad {name} field '{spec}'"
                ))
            })
        };

        Ok(Self {
            minutes: field(parts[0], "minute", 0, 59)?,
            hours: field(parts[1], "hour", 0, 23)?,
            days_of_month: field(parts[2], "day-of-month", 1, 31)?,
            months: field(parts[3], "month", 1, 12)?,
            days_of_week: field(parts[4], "day-of-week", 0, 6)?,
        })
    }

    /// Compute the next matching time strictly after `after`.
    ///
    /// Returns `None` if no minute within the one-year horizon matches
    /// (e.g. `0 0 31 2 *`).
    pub fn next_after(&self, after: Timestamp) -> Option<Timestamp> {
        let horizon = after + Duration::days(SEARCH_HORIZON_DAYS);

        // Start at the next whole minute strictly after `after`.
        let mut candidate = truncate_to_minute(after) + Duration::minutes(1);

        while candidate <= horizon {
            if !self.day_matches(candidate) {
                // Skip to the start of the next day rather than walking
                // 1440 minutes through a non-matching day.
                candidate = truncate_to_day(candidate) + Duration::days(1);
                continue;
            }
            if self.hours.contains(&candidate.hour())
                && self.minutes.contains(&candidate.minute())
            {
                return Some(candidate);
            }
            candidate += Duration::minutes(1);
        }

        None
    }

    /// Whether the date part (day-of-month, month, weekday) matches.
    fn day_matches(&self, t: DateTime<Utc>) -> bool {
        self.months.contains(&t.month())
            && self.days_of_month.contains(&t.day())
            && self
                .days_of_week
                .contains(&t.weekday().num_days_from_sunday())
    }
}

fn truncate_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_nanosecond(0)
        .and_then(|t| t.with_second(0))
        .unwrap_or(t)
}

fn truncate_to_day(t: DateTime<Utc>) -> DateTime<Utc> {
    truncate_to_minute(t)
        .with_minute(0)
        .and_then(|t| t.with_hour(0))
        .unwrap_or(t)
}

// ---------------------------------------------------------------------------
// Field parsing
// ---------------------------------------------------------------------------

/// Parse one cron field into a sorted list of matching values.
///
/// Accepts `*`, `*/N`, comma-separated exact values, or a single exact
/// value. Returns `None` for anything malformed or out of `[min, max]`.
fn parse_field(field: &str, min: u32, max: u32) -> Option<Vec<u32>> {
    if field == "*" {
        return Some((min..=max).collect());
    }

    if let Some(step) = field.strip_prefix("*/") {
        let n: u32 = step.parse().ok()?;
        if n == 0 {
            return None;
        }
        return Some((min..=max).step_by(n as usize).collect());
    }

    let mut values = Vec::new();
    for part in field.split(',') {
        let n: u32 = part.trim().parse().ok()?;
        if n < min || n > max {
            return None;
        }
        values.push(n);
    }
    values.sort_unstable();
    values.dedup();
    Some(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> Timestamp {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    // -- parsing --------------------------------------------------------------

    #[test]
    fn parse_wildcard_expression() {
        let schedule = CronSchedule::parse("* * * * *").unwrap();
        assert_eq!(schedule.minutes.len(), 60);
        assert_eq!(schedule.hours.len(), 24);
        assert_eq!(schedule.days_of_week.len(), 7);
    }

    #[test]
    fn parse_step_and_list() {
        let schedule = CronSchedule::parse("*/15 0,12 * * *").unwrap();
        assert_eq!(schedule.minutes, vec![0, 15, 30, 45]);
        assert_eq!(schedule.hours, vec![0, 12]);
    }

    #[test]
    fn parse_rejects_wrong_field_count() {
        assert!(CronSchedule::parse("* * * *").is_err());
        assert!(CronSchedule::parse("bad").is_err());
    }

    #[test]
    fn parse_rejects_out_of_range_values() {
        assert!(CronSchedule::parse("60 * * * *").is_err());
        assert!(CronSchedule::parse("* 24 * * *").is_err());
        assert!(CronSchedule::parse("* * 0 * *").is_err());
        assert!(CronSchedule::parse("* * * 13 *").is_err());
        assert!(CronSchedule::parse("* * * * 7").is_err());
    }

    #[test]
    fn parse_rejects_zero_step() {
        assert!(CronSchedule::parse("*/0 * * * *").is_err());
    }

    // -- next_after -----------------------------------------------------------

    #[test]
    fn daily_at_two_is_strictly_after() {
        let schedule = CronSchedule::parse("0 2 * * *").unwrap();
        // Before 02:00 on the same day.
        let next = schedule.next_after(at(2026, 3, 10, 1, 30, 0)).unwrap();
        assert_eq!(next, at(2026, 3, 10, 2, 0, 0));
        // Exactly 02:00 must roll to the next day (strictly after).
        let next = schedule.next_after(at(2026, 3, 10, 2, 0, 0)).unwrap();
        assert_eq!(next, at(2026, 3, 11, 2, 0, 0));
    }

    #[test]
    fn every_fifteen_minutes() {
        let schedule = CronSchedule::parse("*/15 * * * *").unwrap();
        let next = schedule.next_after(at(2026, 3, 10, 10, 2, 0)).unwrap();
        assert_eq!(next, at(2026, 3, 10, 10, 15, 0));
        let next = schedule.next_after(next).unwrap();
        assert_eq!(next, at(2026, 3, 10, 10, 30, 0));
    }

    #[test]
    fn seconds_are_truncated() {
        let schedule = CronSchedule::parse("* * * * *").unwrap();
        let next = schedule.next_after(at(2026, 3, 10, 10, 2, 47)).unwrap();
        assert_eq!(next, at(2026, 3, 10, 10, 3, 0));
    }

    #[test]
    fn weekday_zero_is_sunday() {
        let schedule = CronSchedule::parse("0 9 * * 0").unwrap();
        // 2026-03-10 is a Tuesday; the next Sunday is 2026-03-15.
        let next = schedule.next_after(at(2026, 3, 10, 12, 0, 0)).unwrap();
        assert_eq!(next, at(2026, 3, 15, 9, 0, 0));
    }

    #[test]
    fn day_of_month_rollover_across_month() {
        let schedule = CronSchedule::parse("30 4 1 * *").unwrap();
        let next = schedule.next_after(at(2026, 3, 10, 0, 0, 0)).unwrap();
        assert_eq!(next, at(2026, 4, 1, 4, 30, 0));
    }

    #[test]
    fn month_field_restricts_match() {
        let schedule = CronSchedule::parse("0 0 1 6 *").unwrap();
        let next = schedule.next_after(at(2026, 3, 10, 0, 0, 0)).unwrap();
        assert_eq!(next, at(2026, 6, 1, 0, 0, 0));
    }

    #[test]
    fn impossible_date_exhausts_horizon() {
        // February 31st never exists.
        let schedule = CronSchedule::parse("0 0 31 2 *").unwrap();
        assert!(schedule.next_after(at(2026, 1, 1, 0, 0, 0)).is_none());
    }

    #[test]
    fn leap_day_found_within_horizon() {
        let schedule = CronSchedule::parse("0 0 29 2 *").unwrap();
        // 2028 is a leap year; searching from mid-2027 stays in the horizon.
        let next = schedule.next_after(at(2027, 6, 1, 0, 0, 0)).unwrap();
        assert_eq!(next, at(2028, 2, 29, 0, 0, 0));
    }
}
