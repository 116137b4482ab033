//! Five-field cron expressions evaluated in UTC, backed by [`cron::Schedule`].
//!
//! Fields are `minute hour day-of-month month day-of-week`. Each field takes
//! `*`, single values, ranges (`1-5`), steps (`*/15`, `0-30/10`) and
//! comma-separated lists of those. Months and weekdays accept three-letter
//! names; weekday `0` and `7` are Sunday. When both day fields are restricted
//! a day matches if either does, otherwise both must match.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Utc};
use citeflow_shared::{CiteflowError, Result};
use ::cron::Schedule;

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const WEEKDAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// How far ahead `next_after` looks before giving up on an expression
/// that can never match (e.g. `0 0 30 2 *`).
const SEARCH_YEARS: i32 = 5;

/// A parsed cron expression.
#[derive(Clone)]
pub struct CronSchedule {
    expr: String,
    /// One schedule, or two (day-of-month and day-of-week) OR-ed together.
    schedules: Vec<Schedule>,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CiteflowError::schedule(format!(
                "cron expression '{expr}' must have 5 fields, found {}",
                fields.len()
            )));
        }
        let expr = fields.join(" ");

        let minute = check_field(fields[0], "minute")?;
        let hour = check_field(fields[1], "hour")?;
        let day = check_field(fields[2], "day-of-month")?;
        let month = month_field(fields[3])?;
        let weekday = weekday_field(fields[4])?;

        let day_restricted = !fields[2].starts_with('*');
        let weekday_restricted = !fields[4].starts_with('*');

        let mut variants = Vec::new();
        if day_restricted && weekday_restricted {
            variants.push((day.as_str(), "*"));
            variants.push(("*", weekday.as_str()));
        } else {
            variants.push((day.as_str(), weekday.as_str()));
        }

        let schedules = variants
            .into_iter()
            .map(|(dom, dow)| {
                // the cron crate expects a leading seconds field
                let full = format!("0 {minute} {hour} {dom} {month} {dow}");
                Schedule::from_str(&full).map_err(|e| {
                    CiteflowError::schedule(format!("invalid cron expression '{expr}': {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { expr, schedules })
    }

    pub fn expression(&self) -> &str {
        &self.expr
    }

    /// The first matching minute strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let limit = after.year() + SEARCH_YEARS;
        self.schedules
            .iter()
            .filter_map(|s| s.after(&after).next())
            .min()
            .filter(|t| t.year() <= limit)
    }
}

impl PartialEq for CronSchedule {
    fn eq(&self, other: &Self) -> bool {
        self.expr == other.expr
    }
}

impl Eq for CronSchedule {}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronSchedule").field(&self.expr).finish()
    }
}

impl FromStr for CronSchedule {
    type Err = CiteflowError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expr)
    }
}

fn field_error(name: &str, part: &str, detail: impl fmt::Display) -> CiteflowError {
    CiteflowError::schedule(format!("invalid cron {name} field '{part}': {detail}"))
}

/// Reject zero steps and reversed numeric ranges before the cron crate sees them.
fn check_field(field: &str, name: &str) -> Result<String> {
    for part in field.split(',') {
        let range = match part.split_once('/') {
            Some((range, step)) => {
                match step.parse::<u32>() {
                    Ok(0) => return Err(field_error(name, part, "step must be positive")),
                    Ok(_) => {}
                    Err(_) => return Err(field_error(name, part, "step is not a number")),
                }
                range
            }
            None => part,
        };
        if let Some((a, b)) = range.split_once('-') {
            if let (Ok(a), Ok(b)) = (a.parse::<u32>(), b.parse::<u32>()) {
                if a > b {
                    return Err(field_error(name, part, format!("range {a}-{b} is reversed")));
                }
            }
        }
    }
    Ok(field.to_string())
}

/// Month names become numbers; both calendars count months from 1.
fn month_field(field: &str) -> Result<String> {
    let numbered: Vec<String> = field
        .split(',')
        .map(|part| {
            part.split('/')
                .enumerate()
                .map(|(i, piece)| {
                    if i > 0 {
                        return piece.to_string();
                    }
                    piece
                        .split('-')
                        .map(|v| name_index(v, &MONTH_NAMES).map_or(v.to_string(), |i| (i + 1).to_string()))
                        .collect::<Vec<_>>()
                        .join("-")
                })
                .collect::<Vec<_>>()
                .join("/")
        })
        .collect();
    check_field(&numbered.join(","), "month")
}

/// Expand a Unix day-of-week field (0-7, Sunday = 0 or 7) into the explicit
/// list the cron crate expects (1-7, Sunday = 1).
fn weekday_field(field: &str) -> Result<String> {
    const NAME: &str = "day-of-week";
    if field == "*" {
        return Ok("*".to_string());
    }

    let mut days = [false; 7];
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => match step.parse::<u32>() {
                Ok(0) | Err(_) => return Err(field_error(NAME, part, "step must be a positive number")),
                Ok(step) => (range, step),
            },
            None => (part, 1),
        };
        let value = |raw: &str| -> Result<u32> {
            if let Some(i) = name_index(raw, &WEEKDAY_NAMES) {
                return Ok(i as u32);
            }
            match raw.parse::<u32>() {
                Ok(v) if v <= 7 => Ok(v),
                Ok(v) => Err(field_error(NAME, part, format!("{v} is outside 0-7"))),
                Err(_) => Err(field_error(NAME, part, format!("'{raw}' is not a weekday"))),
            }
        };

        let (start, end) = if range == "*" {
            (0, 6)
        } else if let Some((a, b)) = range.split_once('-') {
            (value(a)?, value(b)?)
        } else {
            let v = value(range)?;
            if part.contains('/') { (v, 6) } else { (v, v) }
        };
        if start > end {
            return Err(field_error(NAME, part, format!("range {start}-{end} is reversed")));
        }
        for v in (start..=end).step_by(step as usize) {
            days[(v % 7) as usize] = true;
        }
    }

    let list: Vec<String> = days
        .iter()
        .enumerate()
        .filter(|(_, on)| **on)
        .map(|(i, _)| (i + 1).to_string())
        .collect();
    Ok(list.join(","))
}

fn name_index(raw: &str, names: &[&str]) -> Option<usize> {
    let lower = raw.to_ascii_lowercase();
    names.iter().position(|n| *n == lower)
}
