//! Five-field cron schedules (`minute hour day-of-month month day-of-week`).
//!
//! Every field accepts `*`, `*/n`, `a-b`, a plain number, or a comma list of
//! those. `*/n` matches values divisible by `n`. Day-of-month and day-of-week
//! must both match; there is no "either" rule.

use std::str::FromStr;

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::CronError;

/// Job type assumed when a schedule does not name one.
pub const DEFAULT_JOB_TYPE: &str = "ingest";

/// `(name, min, max)` per field position.
const FIELDS: [(&str, u32, u32); 5] = [
    ("minute",       0, 59),
    ("hour",         0, 23),
    ("day_of_month", 1, 31),
    ("month",        1, 12),
    ("day_of_week",  0, 6),
];

const SEARCH_HORIZON_MINUTES: i64 = 366 * 24 * 60;

// ---------------------------------------------------------------------------
// CronJob
// ---------------------------------------------------------------------------

/// A named schedule that enqueues one job type for one tenant and source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronJob {
    pub name: String,
    #[serde(alias = "cron")]
    pub cron_expr: String,
    pub tenant_id: String,
    pub source_id: String,
    #[serde(default)]
    pub job_type: String,
    #[serde(default)]
    pub enabled: bool,
    /// IANA timezone the expression is evaluated in; empty uses the
    /// trigger engine's default.
    #[serde(default)]
    pub timezone: String,
}

impl CronJob {
    /// An enabled schedule with the default job type and timezone.
    pub fn new(
        name: impl Into<String>,
        cron_expr: impl Into<String>,
        tenant_id: impl Into<String>,
        source_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            cron_expr: cron_expr.into(),
            tenant_id: tenant_id.into(),
            source_id: source_id.into(),
            job_type: String::new(),
            enabled: true,
            timezone: String::new(),
        }
    }

    pub fn with_job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = job_type.into();
        self
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// The job type to enqueue, falling back to [`DEFAULT_JOB_TYPE`].
    pub fn effective_job_type(&self) -> &str {
        match self.job_type.trim() {
            "" => DEFAULT_JOB_TYPE,
            jt => jt,
        }
    }

    /// Check required fields, the timezone, and the cron expression.
    pub fn validate(&self) -> Result<(), CronError> {
        let required = [
            ("name", &self.name),
            ("cron", &self.cron_expr),
            ("tenant_id", &self.tenant_id),
            ("source_id", &self.source_id),
        ];
        if let Some(&(field, _)) = required.iter().find(|(_, v)| v.trim().is_empty()) {
            return Err(CronError::MissingField(field));
        }

        let tz = self.timezone.trim();
        if !tz.is_empty() && tz.parse::<Tz>().is_err() {
            return Err(CronError::InvalidTimezone(tz.to_owned()));
        }

        validate_cron_expr(&self.cron_expr)
    }
}

// ---------------------------------------------------------------------------
// Parsed schedule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Term {
    Any,
    Every(u32),
    Range(u32, u32),
    Exact(u32),
}

impl Term {
    fn matches(self, value: u32) -> bool {
        match self {
            Term::Any         => true,
            Term::Every(n)    => value % n == 0,
            Term::Range(a, b) => (a..=b).contains(&value),
            Term::Exact(n)    => value == n,
        }
    }
}

/// A validated cron expression, ready for matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    fields: [Vec<Term>; 5],
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != FIELDS.len() {
            return Err(CronError::FieldCount(parts.len()));
        }

        let mut fields: [Vec<Term>; 5] = Default::default();
        for (index, (part, (name, min, max))) in parts.into_iter().zip(FIELDS).enumerate() {
            fields[index] = parse_field(part, min, max)
                .map_err(|reason| CronError::InvalidField { index, name, reason })?;
        }
        Ok(Self { fields })
    }

    /// Whether the wall-clock minute of `t` matches all five fields.
    pub fn matches<Z: TimeZone>(&self, t: &DateTime<Z>) -> bool {
        let values = [
            t.minute(),
            t.hour(),
            t.day(),
            t.month(),
            t.weekday().num_days_from_sunday(),
        ];
        self.fields
            .iter()
            .zip(values)
            .all(|(terms, value)| terms.iter().any(|term| term.matches(value)))
    }

    /// First matching minute strictly after `now`, evaluated in `tz`.
    ///
    /// Walks forward one minute at a time for up to 366 days.
    pub fn next_after(&self, now: DateTime<Utc>, tz: Tz) -> Result<DateTime<Utc>, CronError> {
        let secs = now.timestamp();
        let start = secs - secs.rem_euclid(60) + 60;

        for step in 0..=SEARCH_HORIZON_MINUTES {
            let Some(candidate) = DateTime::<Utc>::from_timestamp(start + step * 60, 0) else {
                break;
            };
            if self.matches(&candidate.with_timezone(&tz)) {
                return Ok(candidate);
            }
        }
        Err(CronError::NoRunFound)
    }
}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn parse_field(field: &str, min: u32, max: u32) -> Result<Vec<Term>, &'static str> {
    if field.is_empty() {
        return Err("empty");
    }
    field
        .split(',')
        .map(|item| parse_term(item.trim(), min, max))
        .collect()
}

fn parse_term(item: &str, min: u32, max: u32) -> Result<Term, &'static str> {
    if item.is_empty() {
        return Err("empty list item");
    }
    if item == "*" {
        return Ok(Term::Any);
    }
    if let Some(step) = item.strip_prefix("*/") {
        return match step.parse::<u32>() {
            Ok(n) if n > 0 => Ok(Term::Every(n)),
            _ => Err("invalid step"),
        };
    }
    if let Some((a, b)) = item.split_once('-') {
        let (Ok(a), Ok(b)) = (a.trim().parse::<u32>(), b.trim().parse::<u32>()) else {
            return Err("invalid range number");
        };
        if a > b {
            return Err("range start > end");
        }
        if a < min || b > max {
            return Err("range out of bounds");
        }
        return Ok(Term::Range(a, b));
    }

    let n = item.parse::<u32>().map_err(|_| "invalid number")?;
    if n < min || n > max {
        return Err("number out of bounds");
    }
    Ok(Term::Exact(n))
}

// ---------------------------------------------------------------------------
// Free functions
// ---------------------------------------------------------------------------

/// Validate a five-field cron expression without keeping the parse.
pub fn validate_cron_expr(expr: &str) -> Result<(), CronError> {
    CronSchedule::parse(expr).map(drop)
}

/// Next time `expr` fires after `now`, with fields read as wall-clock time in `tz`.
pub fn next_run(now: DateTime<Utc>, expr: &str, tz: Tz) -> Result<DateTime<Utc>, CronError> {
    CronSchedule::parse(expr)?.next_after(now, tz)
}

/// Resolve an IANA timezone name; blank or unknown names give `default`.
pub fn resolve_timezone(name: &str, default: Tz) -> Tz {
    match name.trim() {
        "" => default,
        name => name.parse().unwrap_or(default),
    }
}
