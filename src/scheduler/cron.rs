use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule as CronSchedule;

use crate::error::{Result, SentinelError};

/// Parse a cron expression with a leading seconds field.
pub fn parse(expr: &str) -> Result<CronSchedule> {
    CronSchedule::from_str(expr)
        .map_err(|e| SentinelError::Config(format!("invalid cron expression '{expr}': {e}")))
}

/// Next firing strictly after `after`.
pub fn next_fire(schedule: &CronSchedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

/// Firing time of `expr` closest to `at`, if one lies within `tolerance`.
///
/// Unparseable expressions never match.
pub fn firing_near(expr: &str, at: DateTime<Utc>, tolerance: Duration) -> Option<DateTime<Utc>> {
    let schedule = CronSchedule::from_str(expr).ok()?;
    let end = at + tolerance;
    schedule
        .after(&(at - tolerance))
        .take_while(|t| *t <= end)
        .min_by_key(|t| (*t - at).num_seconds().abs())
}
