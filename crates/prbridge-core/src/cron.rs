//! Cron expression handling for the reminder schedule
//!
//! The `cron` crate wants 6-field expressions (with seconds) and 1-based
//! weekdays; operators write standard 5-field cron with 0-based weekdays.
//! This wrapper normalizes between the two.

use chrono::{DateTime, Utc};
use cron::Schedule as CronLib;
use std::str::FromStr;

use crate::Error;

/// Weekday mornings at 09:00 UTC.
pub const WEEKDAY_MORNINGS: &str = "0 9 * * 1-5";

#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: CronLib,
}

impl CronSchedule {
    pub fn new(expression: &str) -> Result<Self, Error> {
        let expanded = normalize(expression);
        let schedule = CronLib::from_str(&expanded).map_err(|e| {
            Error::Config(format!("Invalid cron expression '{}': {}", expression, e))
        })?;

        Ok(Self { expression: expression.to_string(), schedule })
    }

    /// The next occurrence strictly after `from`.
    pub fn next_after(&self, from: &DateTime<Utc>) -> Result<DateTime<Utc>, Error> {
        self.schedule
            .after(from)
            .next()
            .ok_or_else(|| Error::Config("Cron schedule has no future occurrence".to_string()))
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }
}

/// Convert a 5-field expression to the 6-field form the library expects,
/// shifting the weekday field from 0-6 (Sun-Sat) to 1-7.
fn normalize(expression: &str) -> String {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return expression.to_string();
    }

    let mut converted = vec!["0".to_string()];
    for (i, field) in fields.iter().enumerate() {
        if i == 4 {
            converted.push(shift_weekdays(field));
        } else {
            converted.push(field.to_string());
        }
    }
    converted.join(" ")
}

fn shift_weekdays(field: &str) -> String {
    if field == "*" {
        return field.to_string();
    }
    if field.contains(',') {
        return field.split(',').map(shift_weekdays).collect::<Vec<_>>().join(",");
    }
    if let Some((start, end)) = field.split_once('-') {
        return format!("{}-{}", shift_weekdays(start), shift_weekdays(end));
    }
    match field.parse::<u8>() {
        Ok(day) if day <= 6 => (day + 1).to_string(),
        _ => field.to_string(),
    }
}
