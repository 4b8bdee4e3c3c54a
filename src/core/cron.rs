//! Cron expression parsing and next-match search.
//!
//! Expressions have five or six whitespace-separated fields:
//!
//! ```text
//! minute hour day-of-month month day-of-week [second]
//! ```
//!
//! The optional sixth field is the second; without it, expressions fire at
//! second zero. Each field accepts `*`, `?`, single values, ranges (`a-b`),
//! steps (`*/s`, `a-b/s`, `a/s`) and comma-separated lists. Months and
//! weekdays also accept three-letter English names, and weekday `7` is an
//! alias for Sunday. The `@yearly`, `@annually`, `@monthly`, `@weekly`,
//! `@daily`, `@midnight` and `@hourly` shortcuts are recognised.
//!
//! When both day-of-month and day-of-week are restricted a day matches if
//! either field matches; otherwise both must match. A field counts as
//! unrestricted when it starts with `*` or `?`, the same rule Vixie cron uses.
//!
//! All evaluation happens in UTC.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::core::SchedulerError;

/// Upper bound on how far ahead [`CronSchedule::next_after`] searches.
/// Covers the eight-year gap between leap days around 2100.
const MAX_SEARCH_YEARS: i32 = 9;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    /// Value the first entry of `names` maps to.
    name_base: u32,
}

const SECOND: FieldSpec = FieldSpec { name: "second", min: 0, max: 59, names: &[], name_base: 0 };
const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59, names: &[], name_base: 0 };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23, names: &[], name_base: 0 };
const DAY_OF_MONTH: FieldSpec =
    FieldSpec { name: "day-of-month", min: 1, max: 31, names: &[], name_base: 0 };
const MONTH: FieldSpec =
    FieldSpec { name: "month", min: 1, max: 12, names: &MONTH_NAMES, name_base: 1 };
const DAY_OF_WEEK: FieldSpec =
    FieldSpec { name: "day-of-week", min: 0, max: 7, names: &WEEKDAY_NAMES, name_base: 0 };

/// A parsed cron expression.
///
/// Each field is stored as a bitmask where bit `n` set means value `n` matches.
#[derive(Clone, PartialEq, Eq)]
pub struct CronSchedule {
    source: String,
    seconds: u64,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    /// Parse an expression, rejecting malformed fields and expressions that
    /// can never match (such as February 30th).
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Configuration` describing the offending field.
    pub fn parse(expression: &str) -> Result<Self, SchedulerError> {
        let source = expression.trim().to_string();
        let expanded = expand_shortcut(&source)?;
        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 && fields.len() != 6 {
            return Err(invalid(
                &source,
                &format!("expected 5 or 6 fields, found {}", fields.len()),
            ));
        }

        let field = |text: &str, spec: &FieldSpec| {
            parse_field(text, spec).map_err(|reason| invalid(&source, &reason))
        };

        let minutes = field(fields[0], &MINUTE)?;
        let hours = field(fields[1], &HOUR)?;
        let days_of_month = field(fields[2], &DAY_OF_MONTH)?;
        let months = field(fields[3], &MONTH)?;
        let mut days_of_week = field(fields[4], &DAY_OF_WEEK)?;
        let seconds = match fields.get(5) {
            Some(text) => field(text, &SECOND)?,
            None => 1,
        };

        // 7 is Sunday as well.
        if days_of_week & (1u64 << 7) != 0 {
            days_of_week = (days_of_week & !(1u64 << 7)) | 1;
        }

        let schedule = Self {
            dom_restricted: is_restricted(fields[2]),
            dow_restricted: is_restricted(fields[4]),
            source,
            seconds,
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
        };

        if !schedule.can_ever_match() {
            return Err(invalid(&schedule.source, "no calendar date satisfies this expression"));
        }
        Ok(schedule)
    }

    /// The expression as written.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Smallest time strictly greater than `after` that matches every field,
    /// or `None` if nothing matches within the search horizon.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.naive_utc().with_nanosecond(0)? + chrono::Duration::seconds(1);
        let limit_year = start.year().saturating_add(MAX_SEARCH_YEARS);

        let mut date = start.date();
        let mut hour = start.hour();
        let mut minute = start.minute();
        let mut second = start.second();

        loop {
            if date.year() > limit_year {
                return None;
            }

            if !has_bit(self.months, date.month()) {
                date = first_of_next_month(date)?;
                (hour, minute, second) = (0, 0, 0);
                continue;
            }

            if !self.day_matches(date) {
                date = date.succ_opt()?;
                (hour, minute, second) = (0, 0, 0);
                continue;
            }

            let Some(next_hour) = next_bit(self.hours, hour) else {
                date = date.succ_opt()?;
                (hour, minute, second) = (0, 0, 0);
                continue;
            };
            if next_hour != hour {
                (hour, minute, second) = (next_hour, 0, 0);
            }

            let Some(next_minute) = next_bit(self.minutes, minute) else {
                (minute, second) = (0, 0);
                hour += 1;
                if hour > 23 {
                    hour = 0;
                    date = date.succ_opt()?;
                }
                continue;
            };
            if next_minute != minute {
                (minute, second) = (next_minute, 0);
            }

            let Some(next_second) = next_bit(self.seconds, second) else {
                second = 0;
                minute += 1;
                if minute > 59 {
                    minute = 0;
                    hour += 1;
                    if hour > 23 {
                        hour = 0;
                        date = date.succ_opt()?;
                    }
                }
                continue;
            };

            let found: NaiveDateTime = date.and_hms_opt(hour, minute, next_second)?;
            return Some(found.and_utc());
        }
    }

    /// Whether `at` (truncated to the second) matches the expression.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        has_bit(self.seconds, at.second())
            && has_bit(self.minutes, at.minute())
            && has_bit(self.hours, at.hour())
            && has_bit(self.months, at.month())
            && self.day_matches(at.date_naive())
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = has_bit(self.days_of_month, date.day());
        let dow = has_bit(self.days_of_week, date.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// Some month in the set must have a matching day-of-month, unless the
    /// weekday field alone can satisfy the day check.
    fn can_ever_match(&self) -> bool {
        if self.dom_restricted && self.dow_restricted {
            return true;
        }
        (1..=12u32).filter(|m| has_bit(self.months, *m)).any(|month| {
            let longest = days_in_month_max(month);
            (1..=longest).any(|day| has_bit(self.days_of_month, day))
        })
    }
}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronSchedule").field(&self.source).finish()
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for CronSchedule {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for CronSchedule {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for CronSchedule {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::parse(&text).map_err(serde::de::Error::custom)
    }
}

fn invalid(expression: &str, reason: &str) -> SchedulerError {
    SchedulerError::Configuration(format!("invalid cron expression `{expression}`: {reason}"))
}

fn expand_shortcut(source: &str) -> Result<String, SchedulerError> {
    if !source.starts_with('@') {
        return Ok(source.to_string());
    }
    let expanded = match source.to_ascii_lowercase().as_str() {
        "@yearly" | "@annually" => "0 0 1 1 *",
        "@monthly" => "0 0 1 * *",
        "@weekly" => "0 0 * * 0",
        "@daily" | "@midnight" => "0 0 * * *",
        "@hourly" => "0 * * * *",
        _ => return Err(invalid(source, "unknown shortcut")),
    };
    Ok(expanded.to_string())
}

fn is_restricted(field: &str) -> bool {
    !(field.starts_with('*') || field.starts_with('?'))
}

fn parse_field(text: &str, spec: &FieldSpec) -> Result<u64, String> {
    let mut mask = 0u64;
    for part in text.split(',') {
        if part.is_empty() {
            return Err(format!("empty list entry in {} field", spec.name));
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step `{step}` in {} field", spec.name))?;
                if step == 0 {
                    return Err(format!("step must be positive in {} field", spec.name));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (low, high) = if range == "*" || range == "?" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, spec)?, parse_value(b, spec)?)
        } else {
            let value = parse_value(range, spec)?;
            // `a/s` means "from a to the end of the range, every s".
            if step.is_some() {
                (value, spec.max)
            } else {
                (value, value)
            }
        };

        if low > high {
            return Err(format!("range {low}-{high} is reversed in {} field", spec.name));
        }

        let step = step.unwrap_or(1) as usize;
        for value in (low..=high).step_by(step) {
            mask |= 1u64 << value;
        }
    }
    Ok(mask)
}

fn parse_value(text: &str, spec: &FieldSpec) -> Result<u32, String> {
    let value = match text.parse::<u32>() {
        Ok(v) => v,
        Err(_) => spec
            .names
            .iter()
            .position(|name| name.eq_ignore_ascii_case(text))
            .map(|idx| idx as u32 + spec.name_base)
            .ok_or_else(|| format!("invalid value `{text}` in {} field", spec.name))?,
    };
    if value < spec.min || value > spec.max {
        return Err(format!(
            "value {value} out of range {}-{} in {} field",
            spec.min, spec.max, spec.name
        ));
    }
    Ok(value)
}

const fn has_bit(mask: u64, value: u32) -> bool {
    value < 64 && mask & (1u64 << value) != 0
}

/// Smallest set bit at position `>= from`.
const fn next_bit(mask: u64, from: u32) -> Option<u32> {
    if from >= 64 {
        return None;
    }
    let shifted = mask >> from;
    if shifted == 0 {
        None
    } else {
        Some(from + shifted.trailing_zeros())
    }
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDate> {
    if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    }
}

const fn days_in_month_max(month: u32) -> u32 {
    match month {
        2 => 29,
        4 | 6 | 9 | 11 => 30,
        _ => 31,
    }
}
