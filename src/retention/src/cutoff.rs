//! Retention cutoff computation.

use std::str::FromStr;

use chrono::{DateTime, Duration, Months, Utc};

use crate::error::{RetentionError, Result};

/// Unit of a storage's `keep_data` amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
    Years,
}

impl FromStr for KeepUnit {
    type Err = RetentionError;

    fn from_str(s: &str) -> Result<Self> {
        // "M" is months and "m" minutes, everything else is case-insensitive
        if s == "M" {
            return Ok(KeepUnit::Months);
        }
        match s.to_lowercase().as_str() {
            "s" | "sec" | "second" | "seconds" => Ok(KeepUnit::Seconds),
            "m" | "min" | "minute" | "minutes" => Ok(KeepUnit::Minutes),
            "h" | "hour" | "hours" => Ok(KeepUnit::Hours),
            "d" | "day" | "days" => Ok(KeepUnit::Days),
            "w" | "wk" | "week" | "weeks" => Ok(KeepUnit::Weeks),
            "month" | "months" => Ok(KeepUnit::Months),
            "y" | "year" | "years" => Ok(KeepUnit::Years),
            _ => Err(RetentionError::InvalidKeepUnit(s.to_string())),
        }
    }
}

/// Boundary below which data is eligible for removal or archival.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionCutoff {
    pub cutoff_timestamp: DateTime<Utc>,
    /// `keep_data` was zero: everything up to now goes
    pub erase_all: bool,
}

impl RetentionCutoff {
    pub fn is_expired(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp < self.cutoff_timestamp
    }
}

/// `now - keep_data` in the given unit; a zero amount means "erase all" and
/// yields `now` itself.
pub fn compute_cutoff(now: DateTime<Utc>, keep_data: i64, unit: &str) -> Result<RetentionCutoff> {
    if keep_data <= 0 {
        return Ok(RetentionCutoff {
            cutoff_timestamp: now,
            erase_all: true,
        });
    }

    let underflow = || RetentionError::CutoffUnderflow {
        amount: keep_data,
        unit: unit.to_string(),
    };

    let kind = unit.parse::<KeepUnit>()?;
    let cutoff_timestamp = match kind {
        KeepUnit::Months | KeepUnit::Years => {
            let factor = if kind == KeepUnit::Years { 12 } else { 1 };
            let months = u32::try_from(keep_data)
                .ok()
                .and_then(|n| n.checked_mul(factor))
                .ok_or_else(underflow)?;
            now.checked_sub_months(Months::new(months))
        }
        other => {
            let delta = match other {
                KeepUnit::Seconds => Duration::try_seconds(keep_data),
                KeepUnit::Minutes => Duration::try_minutes(keep_data),
                KeepUnit::Hours => Duration::try_hours(keep_data),
                KeepUnit::Days => Duration::try_days(keep_data),
                _ => Duration::try_weeks(keep_data),
            }
            .ok_or_else(underflow)?;
            now.checked_sub_signed(delta)
        }
    }
    .ok_or_else(underflow)?;

    Ok(RetentionCutoff {
        cutoff_timestamp,
        erase_all: false,
    })
}
