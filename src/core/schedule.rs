//! DAG schedules and data intervals.
//!
//! Supports standard cron expressions, extended 6-field cron (with seconds),
//! shortcuts (@daily, @hourly, etc.), and interval expressions (@every).
//! A scheduled run's logical date is an occurrence of the schedule and its
//! data interval extends to the following occurrence.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur when parsing or using schedules.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// Invalid cron expression.
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    /// Invalid interval expression.
    #[error("invalid interval expression: {0}")]
    InvalidInterval(String),

    /// Invalid timezone.
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    /// No more occurrences.
    #[error("no more occurrences")]
    NoMoreOccurrences,
}

/// A parsed DAG schedule.
#[derive(Debug, Clone)]
pub struct Schedule {
    expression: String,
    timezone: Tz,
    kind: ScheduleKind,
}

#[derive(Debug, Clone)]
enum ScheduleKind {
    Cron(Box<CronSchedule>),
    Interval(chrono::Duration),
}

impl Schedule {
    /// Parse a schedule expression in UTC.
    ///
    /// Supports:
    /// - Standard 5-field cron: `minute hour day month weekday`
    /// - Extended 6-field cron: `second minute hour day month weekday`
    /// - Shortcuts: `@yearly`, `@monthly`, `@weekly`, `@daily`, `@hourly`
    /// - Intervals: `@every 5m`, `@every 1h30m`
    pub fn new(expression: impl Into<String>) -> Result<Self, ScheduleError> {
        Self::with_timezone(expression, "UTC")
    }

    /// Parse a schedule expression evaluated in `timezone`.
    pub fn with_timezone(
        expression: impl Into<String>,
        timezone: impl AsRef<str>,
    ) -> Result<Self, ScheduleError> {
        let expression = expression.into();
        let timezone: Tz = timezone
            .as_ref()
            .parse()
            .map_err(|_| ScheduleError::InvalidTimezone(timezone.as_ref().to_string()))?;
        let kind = parse_expression(&expression)?;

        Ok(Self {
            expression,
            timezone,
            kind,
        })
    }

    /// The original expression string.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// The timezone name.
    pub fn timezone(&self) -> &str {
        self.timezone.name()
    }

    /// The first occurrence strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        match &self.kind {
            ScheduleKind::Cron(schedule) => schedule
                .after(&after.with_timezone(&self.timezone))
                .next()
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or(ScheduleError::NoMoreOccurrences),
            ScheduleKind::Interval(step) => after
                .checked_add_signed(*step)
                .ok_or(ScheduleError::NoMoreOccurrences),
        }
    }

    /// The data interval of a run whose logical date is `logical_date`.
    pub fn data_interval(
        &self,
        logical_date: DateTime<Utc>,
    ) -> Result<(DateTime<Utc>, DateTime<Utc>), ScheduleError> {
        Ok((logical_date, self.next_after(logical_date)?))
    }

    /// The latest occurrence in `(since, now]`, if any.
    ///
    /// Missed occurrences collapse: only the most recent one is returned.
    pub fn latest_due(
        &self,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        let mut latest = None;
        let mut cursor = since;
        loop {
            let next = match self.next_after(cursor) {
                Ok(next) => next,
                Err(ScheduleError::NoMoreOccurrences) => return Ok(latest),
                Err(e) => return Err(e),
            };
            if next > now {
                return Ok(latest);
            }
            latest = Some(next);
            cursor = next;
        }
    }
}

impl FromStr for Schedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

fn parse_expression(expression: &str) -> Result<ScheduleKind, ScheduleError> {
    let trimmed = expression.trim();
    if trimmed.starts_with('@') {
        return parse_shortcut(trimmed);
    }
    parse_cron(trimmed)
}

fn parse_shortcut(expression: &str) -> Result<ScheduleKind, ScheduleError> {
    match expression.to_lowercase().as_str() {
        "@yearly" | "@annually" => parse_cron("0 0 1 1 *"),
        "@monthly" => parse_cron("0 0 1 * *"),
        "@weekly" => parse_cron("0 0 * * SUN"),
        "@daily" | "@midnight" => parse_cron("0 0 * * *"),
        "@hourly" => parse_cron("0 * * * *"),
        s if s.starts_with("@every ") => {
            let duration = parse_duration(s["@every ".len()..].trim())?;
            Ok(ScheduleKind::Interval(duration))
        }
        _ => Err(ScheduleError::InvalidCron(format!(
            "unknown shortcut: {}",
            expression
        ))),
    }
}

/// Parse a duration string like "5m", "1h", "1h30m", "30s".
fn parse_duration(s: &str) -> Result<chrono::Duration, ScheduleError> {
    let invalid = || ScheduleError::InvalidInterval(s.to_string());
    let mut total_secs: i64 = 0;
    let mut current_num = String::new();

    for c in s.chars() {
        if c.is_ascii_digit() {
            current_num.push(c);
            continue;
        }
        let num: i64 = current_num.parse().map_err(|_| invalid())?;
        current_num.clear();

        let unit = match c {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'd' => 86400,
            _ => return Err(invalid()),
        };
        total_secs = num
            .checked_mul(unit)
            .and_then(|secs| total_secs.checked_add(secs))
            .ok_or_else(invalid)?;
    }

    if !current_num.is_empty() || total_secs == 0 {
        return Err(invalid());
    }

    chrono::Duration::try_seconds(total_secs).ok_or_else(invalid)
}

fn parse_cron(expression: &str) -> Result<ScheduleKind, ScheduleError> {
    let fields = expression.split_whitespace().count();

    let cron_expr = match fields {
        5 => format!("0 {}", expression),
        6 => expression.to_string(),
        _ => {
            return Err(ScheduleError::InvalidCron(format!(
                "expected 5 or 6 fields, got {}",
                fields
            )));
        }
    };

    let schedule = CronSchedule::from_str(&cron_expr)
        .map_err(|e| ScheduleError::InvalidCron(e.to_string()))?;

    Ok(ScheduleKind::Cron(Box::new(schedule)))
}
