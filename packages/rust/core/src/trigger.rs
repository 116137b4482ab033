//! Trigger rules deciding when a scheduled task becomes due.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use citeflow_shared::{CiteflowError, Result, TriggerKind};

use crate::cron::CronSchedule;

/// When a task runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Every fixed period, starting immediately.
    Interval(Duration),
    Cron(CronSchedule),
    /// Exactly once, at the given instant.
    OneTime(DateTime<Utc>),
}

impl Trigger {
    /// Parse a trigger expression of the given kind.
    ///
    /// Intervals are `<n><unit>` with unit `m` (minutes), `h` or `d`.
    /// One-time triggers take an RFC 3339 timestamp.
    pub fn parse(kind: TriggerKind, expr: &str) -> Result<Self> {
        match kind {
            TriggerKind::Interval => parse_interval(expr).map(Self::Interval),
            TriggerKind::Cron => CronSchedule::parse(expr).map(Self::Cron),
            TriggerKind::OneTime => DateTime::parse_from_rfc3339(expr.trim())
                .map(|t| Self::OneTime(t.with_timezone(&Utc)))
                .map_err(|e| {
                    CiteflowError::schedule(format!("invalid one-time instant '{expr}': {e}"))
                }),
        }
    }

    pub fn kind(&self) -> TriggerKind {
        match self {
            Self::Interval(_) => TriggerKind::Interval,
            Self::Cron(_) => TriggerKind::Cron,
            Self::OneTime(_) => TriggerKind::OneTime,
        }
    }

    /// The expression in the form [`Trigger::parse`] accepts.
    pub fn expression(&self) -> String {
        match self {
            Self::Interval(d) => format_interval(*d),
            Self::Cron(c) => c.expression().to_string(),
            Self::OneTime(t) => t.to_rfc3339(),
        }
    }

    /// `next_run` for a newly registered (or re-enabled) task.
    pub fn initial_run(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Interval(_) => Some(now),
            Self::Cron(c) => c.next_after(now),
            Self::OneTime(at) => (*at >= now).then_some(*at),
        }
    }

    /// `next_run` after a launch at `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Interval(d) => now.checked_add_signed(*d),
            Self::Cron(c) => c.next_after(now),
            Self::OneTime(_) => None,
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind().as_str(), self.expression())
    }
}

fn parse_interval(expr: &str) -> Result<Duration> {
    let expr = expr.trim();
    let split = expr
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| CiteflowError::schedule(format!("interval '{expr}' has no unit")))?;
    let (digits, unit) = expr.split_at(split);

    let n: i64 = digits
        .parse()
        .map_err(|_| CiteflowError::schedule(format!("interval '{expr}' has no count")))?;
    if n <= 0 {
        return Err(CiteflowError::schedule(format!(
            "interval '{expr}' must be positive"
        )));
    }

    let duration = match unit {
        "m" => Duration::try_minutes(n),
        "h" => Duration::try_hours(n),
        "d" => Duration::try_days(n),
        other => {
            return Err(CiteflowError::schedule(format!(
                "unsupported interval unit '{other}' in '{expr}' (expected m, h or d)"
            )));
        }
    };
    duration.ok_or_else(|| CiteflowError::schedule(format!("interval '{expr}' is too large")))
}

fn format_interval(d: Duration) -> String {
    let minutes = d.num_minutes();
    if minutes % (24 * 60) == 0 {
        format!("{}d", minutes / (24 * 60))
    } else if minutes % 60 == 0 {
        format!("{}h", minutes / 60)
    } else {
        format!("{minutes}m")
    }
}
