//! Cron-style schedules for periodic tasks.
//!
//! Expressions have five fields (minute, hour, day of month, month, day of
//! week) and are evaluated by [`cron::Schedule`] with the seconds pinned to
//! zero. Supported syntax per field: `*`, `*/n`, `v`, `a-b`, `a-b/n` and
//! comma-separated lists of those. Day of week counts from 0 = Sunday; 7 is
//! accepted as Sunday too, and three-letter names (`MON-FRI`) work as well.

use crate::error::{ScroogeError, ScroogeResult};
use chrono::{DateTime, TimeZone, Timelike};
use std::collections::BTreeSet;
use std::str::FromStr;

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// A parsed periodic schedule.
#[derive(Debug, Clone)]
pub struct Crontab {
    expression: String,
    /// `None` matches every minute
    schedule: Option<cron::Schedule>,
}

impl PartialEq for Crontab {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl Eq for Crontab {}

impl Crontab {
    /// Build a schedule from individual fields.
    ///
    /// ```rust
    /// use scrooge::crontab::Crontab;
    ///
    /// // Every 15 minutes during office hours on weekdays.
    /// let crontab = Crontab::new("*/15", "9-17", "*", "*", "1-5").unwrap();
    /// # let _ = crontab;
    /// ```
    pub fn new(
        minute: &str,
        hour: &str,
        day: &str,
        month: &str,
        day_of_week: &str,
    ) -> ScroogeResult<Self> {
        let expression = format!("{} {} {} {} {}", minute, hour, day, month, day_of_week);
        for (name, field) in [
            ("minute", minute),
            ("hour", hour),
            ("day", day),
            ("month", month),
            ("day_of_week", day_of_week),
        ] {
            check_field(name, field)?;
        }

        let source = format!(
            "0 {} {} {} {} {}",
            minute,
            hour,
            day,
            month,
            translate_day_of_week(day_of_week)?
        );
        let schedule = cron::Schedule::from_str(&source).map_err(|e| {
            ScroogeError::config(format!("invalid crontab '{}': {}", expression, e))
        })?;

        Ok(Self {
            expression,
            schedule: Some(schedule),
        })
    }

    /// Matches every minute.
    pub fn every_minute() -> Self {
        Self {
            expression: "* * * * *".to_string(),
            schedule: None,
        }
    }

    /// The expression this schedule was built from.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Whether `when` falls on this schedule, evaluated in `when`'s own
    /// timezone. Seconds are ignored.
    pub fn matches<Tz: TimeZone>(&self, when: &DateTime<Tz>) -> bool {
        let Some(schedule) = &self.schedule else {
            return true;
        };
        match when.with_second(0).and_then(|t| t.with_nanosecond(0)) {
            Some(minute) => schedule.includes(minute),
            None => false,
        }
    }
}

impl FromStr for Crontab {
    type Err = ScroogeError;

    /// Parse a five-field expression such as `"0 */2 * * 1-5"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        match fields.as_slice() {
            [minute, hour, day, month, day_of_week] => {
                Crontab::new(minute, hour, day, month, day_of_week)
            }
            _ => Err(ScroogeError::config(format!(
                "crontab '{}' must have exactly five fields",
                s
            ))),
        }
    }
}

impl std::fmt::Display for Crontab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.expression)
    }
}

fn invalid(name: &str, raw: &str, detail: impl std::fmt::Display) -> ScroogeError {
    ScroogeError::config(format!(
        "invalid crontab {} field '{}': {}",
        name, raw, detail
    ))
}

/// Shape checks the cron parser is lenient about: empty list elements,
/// zero or non-numeric steps, steps on a single value and reversed ranges.
fn check_field(name: &str, raw: &str) -> ScroogeResult<()> {
    for piece in raw.split(',') {
        if piece.is_empty() {
            return Err(invalid(name, raw, "empty list element"));
        }

        let range = match piece.split_once('/') {
            Some((range, step)) => {
                match step.parse::<u32>() {
                    Ok(0) => return Err(invalid(name, raw, "step must be positive")),
                    Ok(_) => {}
                    Err(_) => return Err(invalid(name, raw, format!("bad step '{}'", step))),
                }
                if range != "*" && !range.contains('-') {
                    return Err(invalid(name, raw, "a step needs '*' or a range"));
                }
                range
            }
            None => piece,
        };

        if let Some((start, end)) = range.split_once('-') {
            if let (Ok(start), Ok(end)) = (start.parse::<u32>(), end.parse::<u32>()) {
                if start > end {
                    return Err(invalid(
                        name,
                        raw,
                        format!("range {}-{} is reversed", start, end),
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Rewrite a 0 = Sunday day-of-week field into day names, which the cron
/// parser reads unambiguously. Named fields pass through untouched.
fn translate_day_of_week(raw: &str) -> ScroogeResult<String> {
    if raw == "*" || raw.chars().any(|c| c.is_ascii_alphabetic()) {
        return Ok(raw.to_string());
    }

    let mut days = BTreeSet::new();
    for piece in raw.split(',') {
        let (range, step) = match piece.split_once('/') {
            Some((range, step)) => (range, step.parse::<usize>().unwrap_or(1)),
            None => (piece, 1),
        };
        let (start, end) = match range.split_once('-') {
            _ if range == "*" => (0, 7),
            Some((start, end)) => (day_number(raw, start)?, day_number(raw, end)?),
            None => {
                let day = day_number(raw, range)?;
                (day, day)
            }
        };
        days.extend((start..=end).step_by(step).map(|day| day % 7));
    }

    Ok(days
        .into_iter()
        .map(|day| DAY_NAMES[day])
        .collect::<Vec<_>>()
        .join(","))
}

fn day_number(raw: &str, value: &str) -> ScroogeResult<usize> {
    match value.parse::<usize>() {
        Ok(day) if day <= 7 => Ok(day),
        Ok(day) => Err(invalid("day_of_week", raw, format!("{} is outside 0-7", day))),
        Err(_) => Err(invalid(
            "day_of_week",
            raw,
            format!("'{}' is not a number", value),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, 0)
            .unwrap()
            .and_utc()
    }

    #[test]
    fn test_every_minute() {
        let crontab = Crontab::every_minute();
        assert!(crontab.matches(&at(2024, 1, 1, 0, 0)));
        assert!(crontab.matches(&at(2024, 12, 31, 23, 59)));
        assert_eq!(crontab, "* * * * *".parse().unwrap());
    }

    #[test]
    fn test_seconds_are_ignored() {
        let crontab: Crontab = "30 12 * * *".parse().unwrap();
        let late = at(2024, 3, 4, 12, 30).with_second(42).unwrap();
        assert!(crontab.matches(&late));
    }

    #[test]
    fn test_step_and_range() {
        let crontab = Crontab::new("*/15", "9-17", "*", "*", "*").unwrap();
        assert!(crontab.matches(&at(2024, 3, 4, 9, 0)));
        assert!(crontab.matches(&at(2024, 3, 4, 17, 45)));
        assert!(!crontab.matches(&at(2024, 3, 4, 17, 46)));
        assert!(!crontab.matches(&at(2024, 3, 4, 8, 15)));

        let crontab = Crontab::new("10-30/10", "*", "*", "*", "*").unwrap();
        assert!(crontab.matches(&at(2024, 3, 4, 1, 20)));
        assert!(!crontab.matches(&at(2024, 3, 4, 1, 25)));
    }

    #[test]
    fn test_lists_and_day_of_week() {
        // 2024-03-03 is a Sunday, 2024-03-04 a Monday.
        let crontab: Crontab = "0 0 * * 0,6".parse().unwrap();
        assert!(crontab.matches(&at(2024, 3, 3, 0, 0)));
        assert!(!crontab.matches(&at(2024, 3, 4, 0, 0)));

        let sunday_as_seven: Crontab = "0 0 * * 7".parse().unwrap();
        assert!(sunday_as_seven.matches(&at(2024, 3, 3, 0, 0)));

        let weekend: Crontab = "0 0 * * 6-7".parse().unwrap();
        assert!(weekend.matches(&at(2024, 3, 2, 0, 0)));
        assert!(weekend.matches(&at(2024, 3, 3, 0, 0)));
        assert!(!weekend.matches(&at(2024, 3, 4, 0, 0)));

        let weekdays: Crontab = "0 0 * * MON-FRI".parse().unwrap();
        assert!(weekdays.matches(&at(2024, 3, 4, 0, 0)));
        assert!(!weekdays.matches(&at(2024, 3, 3, 0, 0)));
    }

    #[test]
    fn test_day_of_week_translation() {
        assert_eq!(translate_day_of_week("1-5").unwrap(), "MON,TUE,WED,THU,FRI");
        assert_eq!(translate_day_of_week("*/2").unwrap(), "SUN,TUE,THU,SAT");
        assert_eq!(translate_day_of_week("0,7").unwrap(), "SUN");
        assert_eq!(translate_day_of_week("*").unwrap(), "*");
    }

    #[test]
    fn test_day_and_month() {
        let crontab = Crontab::new("0", "12", "1,15", "2", "*").unwrap();
        assert!(crontab.matches(&at(2024, 2, 15, 12, 0)));
        assert!(!crontab.matches(&at(2024, 3, 15, 12, 0)));
        assert!(!crontab.matches(&at(2024, 2, 14, 12, 0)));
    }

    #[test]
    fn test_display_round_trips_expression() {
        let crontab: Crontab = "*/5 0 1 1 1-5".parse().unwrap();
        assert_eq!(crontab.to_string(), "*/5 0 1 1 1-5");
        assert_eq!(crontab.expression(), "*/5 0 1 1 1-5");
    }

    #[test]
    fn test_invalid_expressions() {
        for bad in [
            "60 * * * *",
            "* 24 * * *",
            "* * 0 * *",
            "* * * 13 *",
            "* * * * 8",
            "*/0 * * * *",
            "5/2 * * * *",
            "10-5 * * * *",
            "a * * * *",
            "1,,2 * * * *",
            "* * * *",
        ] {
            let err = bad.parse::<Crontab>().unwrap_err();
            assert!(
                matches!(err, ScroogeError::Config { .. }),
                "expected config error for {}",
                bad
            );
        }
    }
}
