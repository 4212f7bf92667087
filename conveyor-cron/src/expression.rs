//! Cron expression parsing and evaluation.

use crate::error::{CronError, CronResult};
use chrono::{DateTime, TimeZone, Utc};
use cron::Schedule;
use std::collections::BTreeSet;
use std::str::FromStr;

/// Day names indexed by their classic cron number.
const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Parsed cron expression.
#[derive(Debug, Clone)]
pub struct CronExpression {
    schedule: Schedule,
    expression: String,
}

impl CronExpression {
    /// Parse a cron expression.
    ///
    /// Accepts the classic 5-field form (minute precision) as well as the
    /// 6-field form with a leading seconds field and the 7-field form with a
    /// trailing year:
    ///
    /// - Second (0-59), optional
    /// - Minute (0-59)
    /// - Hour (0-23)
    /// - Day of month (1-31)
    /// - Month (1-12 or JAN-DEC)
    /// - Day of week (0-7 or SUN-SAT, where both 0 and 7 are Sunday)
    /// - Year, optional
    ///
    /// # Examples
    ///
    /// ```
    /// use conveyor_cron::CronExpression;
    ///
    /// // Every 5 minutes, 5-field form
    /// let expr = CronExpression::parse("*/5 * * * *").unwrap();
    /// assert_eq!(expr.expression(), "*/5 * * * *");
    ///
    /// // Weekdays at 9 AM, with seconds
    /// let expr = CronExpression::parse("0 0 9 * * 1-5").unwrap();
    /// ```
    pub fn parse(expression: &str) -> CronResult<Self> {
        let normalized = normalize(expression)?;
        let schedule = Schedule::from_str(&normalized)
            .map_err(|e| CronError::InvalidExpression(format!("{}: {}", expression, e)))?;

        Ok(Self {
            schedule,
            expression: expression.trim().to_string(),
        })
    }

    /// Get the next occurrence strictly after the given time.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Get the next occurrence after a millisecond timestamp, as milliseconds.
    pub fn next_after_millis(&self, millis: i64) -> Option<i64> {
        let after = Utc.timestamp_millis_opt(millis).single()?;
        self.next_after(after).map(|t| t.timestamp_millis())
    }

    /// Get the expression string as it was given.
    pub fn expression(&self) -> &str {
        &self.expression
    }
}

impl FromStr for CronExpression {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Expand the 5-field form to the seconds-first form the parser expects and
/// spell out the day of week by name.
fn normalize(expression: &str) -> CronResult<String> {
    let mut fields: Vec<String> = expression.split_whitespace().map(str::to_string).collect();
    let day_of_week = match fields.len() {
        5 => 4,
        6 | 7 => 5,
        n => return Err(CronError::FieldCount(n)),
    };
    fields[day_of_week] = weekday_names(&fields[day_of_week])?;
    if fields.len() == 5 {
        fields.insert(0, "0".to_string());
    }
    Ok(fields.join(" "))
}

/// Rewrite a day-of-week field as a list of day names.
///
/// The parser numbers days 1-7 from Sunday, so numbers are never passed
/// through. Items it cannot read (`*`, `?`, unknown tokens) are left as they
/// are.
fn weekday_names(field: &str) -> CronResult<String> {
    let items = field
        .split(',')
        .map(weekday_item)
        .collect::<CronResult<Vec<_>>>()?;
    Ok(items.join(","))
}

fn weekday_item(item: &str) -> CronResult<String> {
    let (base, step) = match item.split_once('/') {
        Some((base, step)) => (base, Some(step)),
        None => (item, None),
    };

    let bounds = match (base, step) {
        ("*" | "?", None) => None,
        ("*" | "?", Some(_)) => Some((0, 7)),
        _ => match base.split_once('-') {
            Some((lo, hi)) => weekday_number(lo).zip(weekday_number(hi)),
            None => weekday_number(base).map(|d| (d, if step.is_some() { 7 } else { d })),
        },
    };
    let Some((lo, hi)) = bounds else {
        return Ok(item.to_string());
    };

    let invalid = || CronError::InvalidExpression(format!("invalid day of week `{}`", item));
    let step = match step {
        Some(step) => step.parse::<usize>().ok().filter(|s| *s > 0).ok_or_else(invalid)?,
        None => 1,
    };
    if lo > hi || hi > 7 {
        return Err(invalid());
    }

    let days: BTreeSet<usize> = (lo..=hi).step_by(step).map(|d| d % 7).collect();
    Ok(days.into_iter().map(|d| WEEKDAYS[d]).collect::<Vec<_>>().join(","))
}

/// Classic day number (0-7) of a numeric or named token.
fn weekday_number(token: &str) -> Option<usize> {
    if !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit()) {
        return token.parse().ok();
    }
    WEEKDAYS.iter().position(|name| name.eq_ignore_ascii_case(token))
}
