//! Five-field cron expressions: `MIN HOUR DOM MON DOW`.
//!
//! Supported per field: `*`, `*/N`, a single value, or a comma list.
//! Day-of-week uses 0-6 with 0 = Sunday (7 also accepted for Sunday).

use chrono::{DateTime, Datelike, Duration, DurationRound, Timelike, Utc};

use taskrig_core::{Result, TaskRigError};

/// Upper bound on the minute-by-minute search in [`CronSpec::next_occurrence`].
/// Just over a year, so annual dates are found; combinations rarer than that
/// (e.g. Feb 29) return `None`.
const SEARCH_LIMIT_MINUTES: i64 = 370 * 24 * 60;

/// One parsed field of a cron expression.
#[derive(Debug, Clone, PartialEq)]
enum CronField {
    /// `*`
    Any,
    /// `*/N`
    Step(u32),
    /// `N` or `N,M,...`
    Values(Vec<u32>),
}

impl CronField {
    fn parse(input: &str, min: u32, max: u32) -> Result<Self> {
        if input == "*" {
            return Ok(CronField::Any);
        }
        if let Some(step) = input.strip_prefix("*/") {
            let n: u32 = step
                .parse()
                .map_err(|_| invalid(input, "step must be a number"))?;
            if n == 0 || n > max {
                return Err(invalid(input, "step out of range"));
            }
            return Ok(CronField::Step(n));
        }
        let mut values = Vec::new();
        for part in input.split(',') {
            let v: u32 = part
                .parse()
                .map_err(|_| invalid(input, "expected a number"))?;
            if v < min || v > max {
                return Err(invalid(input, "value out of range"));
            }
            values.push(v);
        }
        Ok(CronField::Values(values))
    }

    /// `min` anchors step matching: `*/2` in a 1-based field (day-of-month,
    /// month) matches 1,3,5,... as standard cron does.
    fn matches(&self, value: u32, min: u32) -> bool {
        match self {
            CronField::Any => true,
            CronField::Step(n) => (value - min) % n == 0,
            CronField::Values(values) => values.contains(&value),
        }
    }
}

fn invalid(field: &str, reason: &str) -> TaskRigError {
    TaskRigError::Scheduling(format!("invalid cron field '{field}': {reason}"))
}

/// A validated cron expression.
#[derive(Debug, Clone, PartialEq)]
pub struct CronSpec {
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

impl CronSpec {
    /// Parse and validate a five-field expression.
    pub fn parse(expression: &str) -> Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(TaskRigError::Scheduling(format!(
                "cron expression '{expression}' must have 5 fields, got {}",
                fields.len()
            )));
        }
        Ok(Self {
            minute: CronField::parse(fields[0], 0, 59)?,
            hour: CronField::parse(fields[1], 0, 23)?,
            day_of_month: CronField::parse(fields[2], 1, 31)?,
            month: CronField::parse(fields[3], 1, 12)?,
            day_of_week: parse_day_of_week(fields[4])?,
        })
    }

    /// Whether the expression matches a given instant (minute resolution).
    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        self.minute.matches(t.minute(), 0)
            && self.hour.matches(t.hour(), 0)
            && self.day_of_month.matches(t.day(), 1)
            && self.month.matches(t.month(), 1)
            && self.day_of_week.matches(t.weekday().num_days_from_sunday(), 0)
    }

    /// First matching minute strictly after `after`, or `None` when no match
    /// exists within the search window.
    pub fn next_occurrence(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.duration_trunc(Duration::minutes(1)).ok()?;
        for i in 1..=SEARCH_LIMIT_MINUTES {
            let candidate = start + Duration::minutes(i);
            if self.matches(candidate) {
                return Some(candidate);
            }
        }
        None
    }
}

fn parse_day_of_week(input: &str) -> Result<CronField> {
    // 7 is an accepted alias for Sunday.
    let field = CronField::parse(input, 0, 7)?;
    Ok(match field {
        CronField::Values(values) => {
            CronField::Values(values.into_iter().map(|v| v % 7).collect())
        }
        other => other,
    })
}

/// Convert a fixed interval in minutes to a cron expression.
///
/// Sub-hour intervals map to a minute step; longer ones round down to whole
/// hours, and a day or more coarsens to daily at midnight. 90 minutes
/// therefore fires hourly, matching the registration-time coarsening the
/// schedule format implies.
pub fn interval_to_cron(minutes: u32) -> Result<String> {
    if minutes == 0 {
        return Err(TaskRigError::Validation(
            "interval must be at least 1 minute".into(),
        ));
    }
    if minutes < 60 {
        return Ok(format!("*/{minutes} * * * *"));
    }
    let hours = minutes / 60;
    if hours < 24 {
        Ok(format!("0 */{hours} * * *"))
    } else {
        Ok("0 0 * * *".to_string())
    }
}

/// Estimate the next firing for display and persistence.
///
/// Exact only for simple minute-step patterns (`*/N * * * *`); every other
/// expression returns `None` rather than a wrong guess. The live trigger
/// does its own full occurrence search, so this never affects firing.
pub fn estimate_next_run(expression: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let spec = CronSpec::parse(expression).ok()?;
    let simple_minute_step = matches!(spec.minute, CronField::Step(_))
        && spec.hour == CronField::Any
        && spec.day_of_month == CronField::Any
        && spec.month == CronField::Any
        && spec.day_of_week == CronField::Any;
    if !simple_minute_step {
        return None;
    }
    spec.next_occurrence(now)
}
