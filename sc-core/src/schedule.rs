//! Five-field cron expressions used as the update install window.
//!
//! Fields are `minute hour day-of-month month day-of-week`. Each accepts
//! `*`, single values, ranges (`a-b`), lists (`a,b`) and steps (`*/n`,
//! `a-b/n`, `a/n`). Day-of-week runs 0-7 with both 0 and 7 meaning Sunday.
//!
//! When day-of-month and day-of-week are *both* restricted a day matches if
//! either one matches, as in classic cron. If only one is restricted, only
//! that one is consulted.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

use crate::error::ScError;

/// How far ahead [`CronSchedule::next_after`] searches. Covers Feb 29.
const SEARCH_DAYS: i64 = 366 * 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Field {
    bits: u64,
    restricted: bool,
}

impl Field {
    fn contains(&self, value: u32) -> bool {
        self.bits & (1u64 << value) != 0
    }

    fn values(&self, min: u32, max: u32) -> impl Iterator<Item = u32> + '_ {
        (min..=max).filter(|v| self.contains(*v))
    }
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    source: String,
    minutes: Field,
    hours: Field,
    days_of_month: Field,
    months: Field,
    days_of_week: Field,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, ScError> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        let [minute, hour, dom, month, dow] = parts[..] else {
            return Err(ScError::Other(format!(
                "cron expression needs 5 fields, got {}: {expr:?}",
                parts.len()
            )));
        };

        let mut days_of_week = parse_field(dow, 0, 7)?;
        if days_of_week.contains(7) {
            days_of_week.bits = (days_of_week.bits & !(1 << 7)) | 1;
        }

        Ok(Self {
            source: parts.join(" "),
            minutes: parse_field(minute, 0, 59)?,
            hours: parse_field(hour, 0, 23)?,
            days_of_month: parse_field(dom, 1, 31)?,
            months: parse_field(month, 1, 12)?,
            days_of_week,
        })
    }

    /// Whether `at` (truncated to the minute) is inside the schedule.
    pub fn matches(&self, at: &NaiveDateTime) -> bool {
        self.day_matches(at.date())
            && self.hours.contains(at.hour())
            && self.minutes.contains(at.minute())
    }

    /// First matching minute strictly after `after`.
    pub fn next_after(&self, after: NaiveDateTime) -> Option<NaiveDateTime> {
        let start = after
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(after)
            + Duration::minutes(1);

        let mut date = start.date();
        for _ in 0..SEARCH_DAYS {
            if self.day_matches(date) {
                let earliest = if date == start.date() {
                    start.time()
                } else {
                    NaiveTime::default()
                };
                for hour in self.hours.values(0, 23) {
                    for minute in self.minutes.values(0, 59) {
                        let Some(time) = NaiveTime::from_hms_opt(hour, minute, 0) else {
                            continue;
                        };
                        if time >= earliest {
                            return Some(date.and_time(time));
                        }
                    }
                }
            }
            date = date.succ_opt()?;
        }
        None
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        if !self.months.contains(date.month()) {
            return false;
        }
        let dom = self.days_of_month.contains(date.day());
        let dow = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());
        match (
            self.days_of_month.restricted,
            self.days_of_week.restricted,
        ) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }
}

impl FromStr for CronSchedule {
    type Err = ScError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn parse_field(text: &str, min: u32, max: u32) -> Result<Field, ScError> {
    let bad = |why: &str| ScError::Other(format!("invalid cron field {text:?}: {why}"));
    let mut bits = 0u64;

    for part in text.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((r, s)) => {
                let step: u32 = s.parse().map_err(|_| bad("step is not a number"))?;
                if step == 0 {
                    return Err(bad("step must be positive"));
                }
                (r, Some(step))
            }
            None => (part, None),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let a: u32 = a.parse().map_err(|_| bad("range start is not a number"))?;
            let b: u32 = b.parse().map_err(|_| bad("range end is not a number"))?;
            (a, b)
        } else {
            let v: u32 = range.parse().map_err(|_| bad("not a number"))?;
            // `5/15` means "from 5, every 15".
            (v, if step.is_some() { max } else { v })
        };

        if lo < min || hi > max || lo > hi {
            return Err(bad(&format!("out of range {min}-{max}")));
        }
        let step = step.unwrap_or(1) as usize;
        for v in (lo..=hi).step_by(step) {
            bits |= 1u64 << v;
        }
    }

    Ok(Field {
        bits,
        restricted: text != "*",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap()
    }

    #[test]
    fn parses_lists_ranges_and_steps() {
        let s: CronSchedule = "*/15 1-3,22 * * *".parse().unwrap();
        assert!(s.matches(&at("2026-10-19 02:45")));
        assert!(s.matches(&at("2026-10-19 22:00")));
        assert!(!s.matches(&at("2026-10-19 02:50")));
        assert!(!s.matches(&at("2026-10-19 04:00")));
        assert_eq!(s.to_string(), "*/15 1-3,22 * * *");
    }

    #[test]
    fn rejects_bad_expressions() {
        assert!(CronSchedule::parse("* * * *").is_err());
        assert!(CronSchedule::parse("60 * * * *").is_err());
        assert!(CronSchedule::parse("* * 0 * *").is_err());
        assert!(CronSchedule::parse("*/0 * * * *").is_err());
        assert!(CronSchedule::parse("5-1 * * * *").is_err());
        assert!(CronSchedule::parse("a * * * *").is_err());
    }

    #[test]
    fn sunday_is_zero_or_seven() {
        let zero = CronSchedule::parse("0 3 * * 0").unwrap();
        let seven = CronSchedule::parse("0 3 * * 7").unwrap();
        // 2026-11-01 is a Sunday.
        assert!(zero.matches(&at("2026-11-01 03:00")));
        assert!(seven.matches(&at("2026-11-01 03:00")));
        assert!(!seven.matches(&at("2026-11-02 03:00")));
    }

    #[test]
    fn dom_and_dow_both_restricted_use_or() {
        // 1st of the month OR any Monday.
        let s = CronSchedule::parse("0 3 1 * 1").unwrap();
        assert!(s.matches(&at("2026-10-19 03:00"))); // Monday
        assert!(s.matches(&at("2026-11-01 03:00"))); // Sunday the 1st
        assert!(!s.matches(&at("2026-10-31 03:00"))); // Saturday the 31st

        // Crossing the month boundary picks the 1st, not the next Monday.
        assert_eq!(s.next_after(at("2026-10-31 03:00")), Some(at("2026-11-01 03:00")));
        assert_eq!(s.next_after(at("2026-11-01 03:00")), Some(at("2026-11-02 03:00")));
    }

    #[test]
    fn only_restricted_day_field_is_consulted() {
        let dom_only = CronSchedule::parse("0 0 15 * *").unwrap();
        assert!(!dom_only.matches(&at("2026-10-19 00:00")));
        assert!(dom_only.matches(&at("2026-10-15 00:00")));

        let dow_only = CronSchedule::parse("0 0 * * 1").unwrap();
        assert!(dow_only.matches(&at("2026-10-19 00:00")));
        assert!(!dow_only.matches(&at("2026-10-15 00:00")));
    }

    #[test]
    fn next_after_skips_short_months() {
        let s = CronSchedule::parse("30 2 31 * *").unwrap();
        assert_eq!(s.next_after(at("2026-10-31 02:30")), Some(at("2026-12-31 02:30")));

        let leap = CronSchedule::parse("0 0 29 2 *").unwrap();
        assert_eq!(leap.next_after(at("2026-03-01 00:00")), Some(at("2028-02-29 00:00")));
    }

    #[test]
    fn next_after_same_day_later_minute() {
        let s = CronSchedule::parse("0,30 4 * * *").unwrap();
        assert_eq!(s.next_after(at("2026-10-19 04:00")), Some(at("2026-10-19 04:30")));
        assert_eq!(s.next_after(at("2026-10-19 04:30")), Some(at("2026-10-20 04:00")));
    }
}
