//! Idle window evaluation.
//!
//! An idle window is a recurring instant described by a cron expression in
//! a configured timezone. "Inside the window" means the next firing after
//! the current minute is at most one minute away from now. The expression
//! is always evaluated in local time, so a daily `09:00` window follows
//! daylight saving changes instead of drifting by an hour.
//!
//! Both crontab (5 fields, minute first) and seconds-first (6 or 7 fields)
//! expressions are accepted. Crontab day-of-week numbers (`0`/`7` = Sunday)
//! are translated to the seconds-first numbering (`1` = Sunday).

use std::str::FromStr;

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::ScheduleError;

/// Maximum distance between now and the next firing to count as inside.
const WINDOW_SECS: i64 = 60;

/// A parsed idle schedule bound to a timezone.
#[derive(Debug, Clone)]
pub struct IdleSchedule {
    expr: String,
    schedule: Schedule,
    tz: Tz,
}

impl IdleSchedule {
    /// Parse a cron expression and an IANA timezone name.
    pub fn parse(expr: &str, tz: &str) -> Result<Self, ScheduleError> {
        let tz: Tz = tz.parse().map_err(|e| ScheduleError::InvalidTimezone {
            tz: tz.to_string(),
            message: format!("{e}"),
        })?;

        let normalized = normalize_expr(expr)?;
        let schedule = Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCron {
            expr: expr.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self {
            expr: expr.trim().to_string(),
            schedule,
            tz,
        })
    }

    /// The expression as configured.
    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// Next firing strictly after the minute containing `now`.
    pub fn next_after_minute(&self, now: DateTime<Utc>) -> Option<DateTime<Tz>> {
        let local = now.with_timezone(&self.tz);
        let floored = local.with_second(0).and_then(|d| d.with_nanosecond(0))?;
        self.schedule.after(&floored).next()
    }

    /// Returns true if `now` is inside the idle window.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.next_after_minute(now)
            .map(|next| (next.with_timezone(&Utc) - now).num_seconds().abs() <= WINDOW_SECS)
            .unwrap_or(false)
    }
}

/// Returns true if `now` is inside the idle window described by `expr` in
/// timezone `tz`.
pub fn is_inside_idle_window(
    now: DateTime<Utc>,
    expr: &str,
    tz: &str,
) -> Result<bool, ScheduleError> {
    Ok(IdleSchedule::parse(expr, tz)?.contains(now))
}

fn normalize_expr(expr: &str) -> Result<String, ScheduleError> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    match fields.len() {
        5 => {
            let dow = translate_crontab_dow(fields[4]).ok_or_else(|| {
                ScheduleError::InvalidCron {
                    expr: expr.to_string(),
                    message: format!("invalid day-of-week field '{}'", fields[4]),
                }
            })?;
            Ok(format!(
                "0 {} {} {} {} {}",
                fields[0], fields[1], fields[2], fields[3], dow
            ))
        }
        6 | 7 => Ok(fields.join(" ")),
        n => Err(ScheduleError::InvalidCron {
            expr: expr.to_string(),
            message: format!("expected 5, 6 or 7 fields, got {n}"),
        }),
    }
}

/// Map crontab day-of-week numbers (0-7, Sunday = 0 or 7) to 1-7
/// (Sunday = 1). Names, `*` and `?` pass through unchanged.
fn translate_crontab_dow(field: &str) -> Option<String> {
    let mut parts = Vec::new();
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => (base, Some(step)),
            None => (item, None),
        };

        let mapped = if let Some((start, end)) = base.split_once('-') {
            match (start.parse::<u8>(), end.parse::<u8>()) {
                (Ok(a), Ok(b)) if a <= 7 && b <= 7 => {
                    let a = if a == 7 { 0 } else { a };
                    if b == 7 {
                        // a-7 covers up to Saturday plus Sunday.
                        if a == 0 {
                            "1-7".to_string()
                        } else {
                            format!("{}-7,1", a + 1)
                        }
                    } else if a <= b {
                        format!("{}-{}", a + 1, b + 1)
                    } else {
                        return None;
                    }
                }
                (Err(_), Err(_)) => base.to_string(),
                _ => return None,
            }
        } else {
            match base.parse::<u8>() {
                Ok(n) if n <= 7 => (if n == 7 { 1 } else { n + 1 }).to_string(),
                Ok(_) => return None,
                Err(_) => base.to_string(),
            }
        };

        match step {
            // A step on an expanded wrap-around range is not expressible.
            Some(_) if mapped.contains(',') => return None,
            Some(step) => parts.push(format!("{mapped}/{step}")),
            None => parts.push(mapped),
        }
    }
    Some(parts.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_inside_when_next_firing_within_a_minute() {
        let schedule = IdleSchedule::parse("0 9 * * *", "UTC").unwrap();
        assert!(schedule.contains(utc(2024, 5, 6, 8, 59, 30)));
        // Exactly one minute before is inclusive.
        assert!(schedule.contains(utc(2024, 5, 6, 8, 59, 0)));
    }

    #[test]
    fn test_outside_when_next_firing_far_away() {
        let schedule = IdleSchedule::parse("0 9 * * *", "UTC").unwrap();
        assert!(!schedule.contains(utc(2024, 5, 6, 8, 57, 0)));
        // At 09:00 itself the next firing is tomorrow.
        assert!(!schedule.contains(utc(2024, 5, 6, 9, 0, 0)));
    }

    #[test]
    fn test_every_minute_is_always_inside() {
        let schedule = IdleSchedule::parse("* * * * *", "Europe/Paris").unwrap();
        assert!(schedule.contains(utc(2024, 1, 1, 0, 0, 0)));
        assert!(schedule.contains(utc(2024, 7, 14, 13, 37, 59)));
    }

    #[test]
    fn test_timezone_conversion_across_dst() {
        // Paris switches to CEST on 2024-03-31; 09:00 local moves from
        // 08:00 UTC to 07:00 UTC.
        let schedule = IdleSchedule::parse("0 9 * * *", "Europe/Paris").unwrap();

        // Winter (day before the switch): 09:00 CET = 08:00 UTC.
        assert!(schedule.contains(utc(2024, 3, 30, 7, 59, 30)));
        assert!(!schedule.contains(utc(2024, 3, 30, 6, 59, 30)));

        // Summer (day of the switch): 09:00 CEST = 07:00 UTC.
        assert!(schedule.contains(utc(2024, 3, 31, 6, 59, 30)));
        assert!(!schedule.contains(utc(2024, 3, 31, 7, 59, 30)));

        // A naive UTC evaluation would disagree on the summer day.
        let naive = IdleSchedule::parse("0 9 * * *", "UTC").unwrap();
        assert!(!naive.contains(utc(2024, 3, 31, 6, 59, 30)));
    }

    #[test]
    fn test_seconds_first_expression() {
        let schedule = IdleSchedule::parse("0 30 18 * * *", "UTC").unwrap();
        assert!(schedule.contains(utc(2024, 5, 6, 18, 29, 10)));
        assert_eq!(schedule.expr(), "0 30 18 * * *");
    }

    #[test]
    fn test_crontab_weekday_range() {
        // Weekdays at 09:00. 2024-05-04 is a Saturday, 2024-05-06 a Monday.
        let schedule = IdleSchedule::parse("0 9 * * 1-5", "UTC").unwrap();
        assert!(!schedule.contains(utc(2024, 5, 4, 8, 59, 30)));
        assert!(schedule.contains(utc(2024, 5, 6, 8, 59, 30)));
    }

    #[test]
    fn test_crontab_sunday_as_zero() {
        // 2024-05-05 is a Sunday.
        let schedule = IdleSchedule::parse("0 9 * * 0", "UTC").unwrap();
        assert!(schedule.contains(utc(2024, 5, 5, 8, 59, 30)));
        assert!(!schedule.contains(utc(2024, 5, 6, 8, 59, 30)));
    }

    #[rstest]
    #[case("*", "*")]
    #[case("0", "1")]
    #[case("7", "1")]
    #[case("1-5", "2-6")]
    #[case("0,6", "1,7")]
    #[case("5-7", "6-7,1")]
    #[case("0-7", "1-7")]
    #[case("*/2", "*/2")]
    #[case("MON-FRI", "MON-FRI")]
    fn test_translate_crontab_dow(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(translate_crontab_dow(input).as_deref(), Some(expected));
    }

    #[test]
    fn test_translate_rejects_out_of_range() {
        assert_eq!(translate_crontab_dow("8"), None);
        assert_eq!(translate_crontab_dow("5-2"), None);
        assert_eq!(translate_crontab_dow("5-7/2"), None);
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(matches!(
            IdleSchedule::parse("0 9 * * *", "Mars/Olympus"),
            Err(ScheduleError::InvalidTimezone { .. })
        ));
        assert!(matches!(
            IdleSchedule::parse("not a cron", "UTC"),
            Err(ScheduleError::InvalidCron { .. })
        ));
        assert!(matches!(
            IdleSchedule::parse("0 99 * * *", "UTC"),
            Err(ScheduleError::InvalidCron { .. })
        ));
    }

    #[test]
    fn test_free_function() {
        assert!(is_inside_idle_window(utc(2024, 5, 6, 8, 59, 30), "0 9 * * *", "UTC").unwrap());
        assert!(is_inside_idle_window(utc(2024, 5, 6, 8, 59, 30), "0 9 * * *", "bogus").is_err());
    }
}
