// src/events/crontab.rs
//! Cron expressions evaluated in a source timezone
//!
//! Accepts the five-field Unix form (`min hour dom month dow`) as well as the
//! six/seven-field form of the `cron` crate. Five-field expressions get a
//! zero seconds field and their numeric day-of-week values translated from
//! Unix numbering (0 or 7 = Sunday) to the crate's (1 = Sunday).

use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::collections::BTreeSet;
use std::str::FromStr;

/// Upper bound on occurrences walked through in one query
const MAX_SCAN: usize = 10_000;

#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: Schedule,
    timezone: Tz,
}

impl CronSchedule {
    pub fn parse(expression: &str, timezone: &str) -> Result<Self> {
        let timezone = Tz::from_str(timezone.trim()).map_err(|e| {
            EngineError::InvalidSchedule(format!("unknown timezone '{}': {}", timezone, e))
        })?;
        let normalized = normalize(expression)?;
        let schedule = Schedule::from_str(&normalized).map_err(|e| {
            EngineError::InvalidSchedule(format!("invalid cron '{}': {}", expression, e))
        })?;

        Ok(Self {
            expression: expression.trim().to_string(),
            schedule,
            timezone,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// First occurrence strictly after `at`
    pub fn next_after(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&at.with_timezone(&self.timezone))
            .next()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Most recent occurrence in `(now - window, now]`
    pub fn fires_in_window(&self, now: DateTime<Utc>, window: Duration) -> Option<DateTime<Utc>> {
        let start = (now - window).with_timezone(&self.timezone);
        self.schedule
            .after(&start)
            .take(MAX_SCAN)
            .map(|t| t.with_timezone(&Utc))
            .take_while(|t| *t <= now)
            .last()
    }

    /// Occurrences strictly between `after` and `before`, capped at an
    /// internal scan limit
    pub fn count_between(&self, after: DateTime<Utc>, before: DateTime<Utc>) -> usize {
        self.schedule
            .after(&after.with_timezone(&self.timezone))
            .take(MAX_SCAN)
            .take_while(|t| t.with_timezone(&Utc) < before)
            .count()
    }

    /// Gap between `occurrence` and the one after it
    pub fn gap_after(&self, occurrence: DateTime<Utc>) -> Option<Duration> {
        self.next_after(occurrence).map(|next| next - occurrence)
    }
}

fn normalize(expression: &str) -> Result<String> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.len() {
        5 => {
            let dow = translate_day_of_week(fields[4])?;
            Ok(format!(
                "0 {} {} {} {} {}",
                fields[0], fields[1], fields[2], fields[3], dow
            ))
        }
        6 | 7 => Ok(fields.join(" ")),
        n => Err(EngineError::InvalidSchedule(format!(
            "invalid cron '{}': expected 5 fields, got {}",
            expression, n
        ))),
    }
}

/// Unix day-of-week (0-7, Sunday = 0 or 7) to the `cron` crate's (1-7, Sunday = 1)
fn translate_day_of_week(field: &str) -> Result<String> {
    let invalid = || EngineError::InvalidSchedule(format!("invalid day-of-week '{}'", field));

    let mut kept: Vec<&str> = Vec::new();
    let mut days: BTreeSet<u32> = BTreeSet::new();

    for item in field.split(',') {
        if item.chars().any(|c| c.is_ascii_alphabetic()) || item.starts_with('*') || item == "?" {
            kept.push(item);
            continue;
        }

        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(step.parse::<u32>().map_err(|_| invalid())?)),
            None => (item, None),
        };
        let (start, end) = match range.split_once('-') {
            Some((a, b)) => (
                a.parse::<u32>().map_err(|_| invalid())?,
                b.parse::<u32>().map_err(|_| invalid())?,
            ),
            None => {
                let day = range.parse::<u32>().map_err(|_| invalid())?;
                match step {
                    Some(_) => (day, 6.max(day)),
                    None => (day, day),
                }
            }
        };
        let step = step.unwrap_or(1);
        if start > end || end > 7 || step == 0 {
            return Err(invalid());
        }

        for day in (start..=end).step_by(step as usize) {
            days.insert(day % 7 + 1);
        }
    }

    let mut parts: Vec<String> = kept.into_iter().map(String::from).collect();
    parts.extend(days.into_iter().map(|d| d.to_string()));
    Ok(parts.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};
    use proptest::prelude::*;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_window_match() {
        let cron = CronSchedule::parse("*/5 * * * *", "UTC").unwrap();
        let minute = Duration::seconds(60);

        assert_eq!(cron.fires_in_window(at(12, 8, 0), minute), None);
        assert_eq!(cron.fires_in_window(at(12, 5, 10), minute), Some(at(12, 5, 0)));
        assert_eq!(cron.fires_in_window(at(12, 5, 0), minute), Some(at(12, 5, 0)));
        assert_eq!(cron.fires_in_window(at(12, 6, 0), minute), None);
    }

    #[test]
    fn test_day_of_week_numbering() {
        // 2024-05-05 is a Sunday, 2024-05-06 a Monday
        let sunday = Utc.with_ymd_and_hms(2024, 5, 5, 9, 0, 30).unwrap();
        let monday = Utc.with_ymd_and_hms(2024, 5, 6, 9, 0, 30).unwrap();
        let minute = Duration::seconds(60);

        for expr in ["0 9 * * 0", "0 9 * * 7", "0 9 * * SUN"] {
            let cron = CronSchedule::parse(expr, "UTC").unwrap();
            assert!(cron.fires_in_window(sunday, minute).is_some(), "{}", expr);
            assert!(cron.fires_in_window(monday, minute).is_none(), "{}", expr);
        }

        let weekdays = CronSchedule::parse("0 9 * * 1-5", "UTC").unwrap();
        assert!(weekdays.fires_in_window(monday, minute).is_some());
        assert!(weekdays.fires_in_window(sunday, minute).is_none());

        let weekend = CronSchedule::parse("0 9 * * 6-7", "UTC").unwrap();
        assert!(weekend.fires_in_window(sunday, minute).is_some());
        assert!(weekend.fires_in_window(monday, minute).is_none());
    }

    #[test]
    fn test_translate_day_of_week() {
        assert_eq!(translate_day_of_week("0").unwrap(), "1");
        assert_eq!(translate_day_of_week("1-5").unwrap(), "2,3,4,5,6");
        assert_eq!(translate_day_of_week("0,7").unwrap(), "1");
        assert_eq!(translate_day_of_week("*").unwrap(), "*");
        assert_eq!(translate_day_of_week("MON-FRI").unwrap(), "MON-FRI");
        assert!(translate_day_of_week("8").is_err());
        assert!(translate_day_of_week("5-2").is_err());
    }

    #[test]
    fn test_timezone() {
        let cron = CronSchedule::parse("0 9 * * *", "America/New_York").unwrap();
        // EDT is UTC-4 in May
        assert_eq!(
            cron.fires_in_window(at(13, 0, 20), Duration::seconds(60)),
            Some(at(13, 0, 0))
        );
        assert_eq!(cron.fires_in_window(at(9, 0, 20), Duration::seconds(60)), None);
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(matches!(
            CronSchedule::parse("not a cron", "UTC"),
            Err(EngineError::InvalidSchedule(_))
        ));
        assert!(CronSchedule::parse("61 * * * *", "UTC").is_err());
        assert!(CronSchedule::parse("* * * *", "UTC").is_err());
        assert!(CronSchedule::parse("* * * * *", "Mars/Olympus").is_err());
        assert!(CronSchedule::parse("0 */2 * * * *", "UTC").is_ok());
    }

    #[test]
    fn test_count_between_and_gap() {
        let cron = CronSchedule::parse("*/5 * * * *", "UTC").unwrap();
        assert_eq!(cron.count_between(at(12, 0, 0), at(12, 30, 0)), 5);
        assert_eq!(cron.gap_after(at(12, 0, 0)), Some(Duration::minutes(5)));
    }

    proptest! {
        #[test]
        fn test_minute_step_window(step in 1u32..=30, secs in 0i64..(7 * 24 * 3600)) {
            let now = at(0, 0, 0) + Duration::seconds(secs);
            let cron = CronSchedule::parse(&format!("*/{} * * * *", step), "UTC").unwrap();
            let fired = cron.fires_in_window(now, Duration::seconds(60));

            let minute_mark = now.with_second(0).unwrap();
            if now.minute() % step == 0 {
                prop_assert_eq!(fired, Some(minute_mark));
            } else {
                prop_assert_eq!(fired, None);
            }
        }

        #[test]
        fn test_window_result_is_bounded(secs in 0i64..(30 * 24 * 3600), window in 1i64..7200) {
            let now = at(0, 0, 0) + Duration::seconds(secs);
            let window = Duration::seconds(window);
            let cron = CronSchedule::parse("7 */3 * * *", "Europe/Berlin").unwrap();
            if let Some(fired) = cron.fires_in_window(now, window) {
                prop_assert!(fired <= now);
                prop_assert!(fired > now - window);
                prop_assert!(cron.next_after(fired).map_or(true, |next| next > now));
            }
        }
    }
}
