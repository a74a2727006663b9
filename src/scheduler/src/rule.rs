//! Compile catalog schedule rows into cron expressions.
//!
//! Expressions have six fields, seconds first:
//!
//! | unit                       | expression      |
//! |----------------------------|-----------------|
//! | s, sec, second, seconds    | `*/F * * * * *` |
//! | min, minute, minutes       | `S */F * * * *` |
//! | h, hour, hours             | `S M */F * * *` |
//! | d, day, days               | `S M H */F * *` |
//!
//! `S`, `M` and `H` come from the rule's start time.

use std::str::FromStr;

use common::model::ScheduleRule;
use cron::Schedule;
use tracing::warn;

use crate::error::{Result, SchedulingError};

/// Expression used for every weekly rule.
pub const WEEKLY_FALLBACK: &str = "* * * * * *";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrequencyUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl FromStr for FrequencyUnit {
    type Err = SchedulingError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "s" | "sec" | "second" | "seconds" => Ok(Self::Second),
            "min" | "minute" | "minutes" => Ok(Self::Minute),
            "h" | "hour" | "hours" => Ok(Self::Hour),
            "d" | "day" | "days" => Ok(Self::Day),
            _ => Err(SchedulingError::UnknownUnit(s.to_string())),
        }
    }
}

/// `(hour, minute, second)` of a start time such as `08:30:00` or
/// `08:30:00-03`. Missing or unreadable parts are zero.
pub fn start_components(start_time: Option<&str>) -> (u32, u32, u32) {
    let mut parts = start_time.unwrap_or_default().split(':').map(|part| {
        let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
        digits.parse::<u32>().unwrap_or(0)
    });
    let hour = parts.next().unwrap_or(0);
    let minute = parts.next().unwrap_or(0);
    let second = parts.next().unwrap_or(0);
    (hour, minute, second)
}

pub fn cron_expression(rule: &ScheduleRule) -> Result<String> {
    if rule.is_weekly() {
        warn!(
            schedule_id = rule.id,
            "Weekly schedules fire every second; frequency and start time are ignored"
        );
        return Ok(WEEKLY_FALLBACK.to_string());
    }

    let frequency = rule
        .frequency
        .filter(|f| *f > 0)
        .ok_or(SchedulingError::ZeroFrequency(rule.id))?;
    let unit: FrequencyUnit = rule.frequency_unit.as_deref().unwrap_or_default().parse()?;
    let (hour, minute, second) = start_components(rule.start_time());

    Ok(match unit {
        FrequencyUnit::Second => format!("*/{frequency} * * * * *"),
        FrequencyUnit::Minute => format!("{second} */{frequency} * * * *"),
        FrequencyUnit::Hour => format!("{second} {minute} */{frequency} * * *"),
        FrequencyUnit::Day => format!("{second} {minute} {hour} */{frequency} * *"),
    })
}

/// Parsed schedule for a rule.
pub fn compile(rule: &ScheduleRule) -> Result<(String, Schedule)> {
    let expression = cron_expression(rule)?;
    let schedule =
        Schedule::from_str(&expression).map_err(|e| SchedulingError::InvalidExpression {
            expression: expression.clone(),
            message: e.to_string(),
        })?;
    Ok((expression, schedule))
}
