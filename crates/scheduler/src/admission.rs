//! Admission policy: whether a due trigger may fire.
//!
//! [`AdmissionPolicy::decide`] is pure. Rejections come back as a
//! [`Decision`] value; they are an expected outcome, not an error.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::cron::{resolve_timezone, CronJob};
use crate::PolicyError;

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    PolicyDisabled,
    Allowed,
    MissingTenant,
    TenantDenied,
    TenantNotAllowed,
    JobTypeNotAllowed,
    QuietHoursDeny,
    QuietHoursAllow,
    OutsideQuietHours,
    RateLimitedMinute,
    RateLimitedJobHour,
}

impl DecisionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PolicyDisabled     => "policy_disabled",
            Self::Allowed            => "allowed",
            Self::MissingTenant      => "missing_tenant",
            Self::TenantDenied       => "tenant_denied",
            Self::TenantNotAllowed   => "tenant_not_allowed",
            Self::JobTypeNotAllowed  => "job_type_not_allowed",
            Self::QuietHoursDeny     => "quiet_hours_deny",
            Self::QuietHoursAllow    => "quiet_hours_allow",
            Self::OutsideQuietHours  => "outside_quiet_hours",
            Self::RateLimitedMinute  => "rate_limited_minute",
            Self::RateLimitedJobHour => "rate_limited_job_hour",
        }
    }
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub reason: DecisionReason,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl Decision {
    pub fn allow(reason: DecisionReason) -> Self {
        Self { allowed: true, reason, tags: BTreeMap::new() }
    }

    pub fn deny(reason: DecisionReason) -> Self {
        Self { allowed: false, reason, tags: BTreeMap::new() }
    }

    fn tagged(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_owned(), value.to_owned());
        self
    }
}

// ---------------------------------------------------------------------------
// Quiet hours
// ---------------------------------------------------------------------------

/// `Deny` blocks triggers inside the window; `Allow` blocks them outside it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuietMode {
    #[default]
    Deny,
    Allow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuietHours {
    pub enabled: bool,
    pub timezone: String,
    /// `HH:MM`, inclusive.
    pub start_hhmm: String,
    /// `HH:MM`, exclusive. Equal to the start means the whole day.
    pub end_hhmm: String,
    pub mode: QuietMode,
}

impl Default for QuietHours {
    fn default() -> Self {
        Self {
            enabled: false,
            timezone: "UTC".into(),
            start_hhmm: "22:00".into(),
            end_hhmm: "06:00".into(),
            mode: QuietMode::Deny,
        }
    }
}

impl QuietHours {
    /// Evaluate the window at `now`, regardless of `enabled`.
    pub fn evaluate(&self, now: DateTime<Utc>) -> Decision {
        let local = now.with_timezone(&resolve_timezone(&self.timezone, Tz::UTC));
        let minute_of_day = local.hour() * 60 + local.minute();
        let start = parse_hhmm(&self.start_hhmm).unwrap_or(0);
        let end = parse_hhmm(&self.end_hhmm).unwrap_or(0);
        let inside = is_in_window(minute_of_day, start, end);

        match (self.mode, inside) {
            (QuietMode::Deny, true)   => Decision::deny(DecisionReason::QuietHoursDeny),
            (QuietMode::Deny, false)  => Decision::allow(DecisionReason::OutsideQuietHours),
            (QuietMode::Allow, true)  => Decision::allow(DecisionReason::QuietHoursAllow),
            (QuietMode::Allow, false) => Decision::deny(DecisionReason::OutsideQuietHours),
        }
    }

    fn validate(&self) -> Result<(), PolicyError> {
        let tz = self.timezone.trim();
        if tz.is_empty() || tz.parse::<Tz>().is_err() {
            return Err(PolicyError("quiet_hours.timezone"));
        }
        if parse_hhmm(&self.start_hhmm).is_none() {
            return Err(PolicyError("quiet_hours.start_hhmm"));
        }
        if parse_hhmm(&self.end_hhmm).is_none() {
            return Err(PolicyError("quiet_hours.end_hhmm"));
        }
        Ok(())
    }
}

/// Minutes since midnight for an `HH:MM` string.
pub fn parse_hhmm(s: &str) -> Option<u32> {
    let (h, m) = s.trim().split_once(':')?;
    let (h, m) = (h.parse::<u32>().ok()?, m.parse::<u32>().ok()?);
    (h <= 23 && m <= 59).then_some(h * 60 + m)
}

/// Whether `minute` falls in `[start, end)`, wrapping past midnight when
/// `start > end`. `start == end` covers the whole day.
pub fn is_in_window(minute: u32, start: u32, end: u32) -> bool {
    if start == end {
        return true;
    }
    if start < end {
        return minute >= start && minute < end;
    }
    minute >= start || minute < end
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Tenant and job-type gates, rate thresholds, and quiet hours.
///
/// Treated as immutable once loaded: replace the whole value to change it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionPolicy {
    pub enabled: bool,
    pub max_triggers_per_minute: u32,
    pub max_triggers_per_job_per_hour: u32,
    pub allow_job_types: Vec<String>,
    pub deny_tenants: Vec<String>,
    /// Empty allows every tenant not denied.
    pub allow_tenants: Vec<String>,
    pub quiet_hours: QuietHours,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_triggers_per_minute: 60,
            max_triggers_per_job_per_hour: 12,
            allow_job_types: vec![crate::DEFAULT_JOB_TYPE.into()],
            deny_tenants: Vec::new(),
            allow_tenants: Vec::new(),
            quiet_hours: QuietHours::default(),
        }
    }
}

impl AdmissionPolicy {
    /// A policy that admits everything.
    pub fn disabled() -> Self {
        Self { enabled: false, ..Self::default() }
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.max_triggers_per_minute == 0 {
            return Err(PolicyError("max_triggers_per_minute"));
        }
        if self.max_triggers_per_job_per_hour == 0 {
            return Err(PolicyError("max_triggers_per_job_per_hour"));
        }
        if self.allow_job_types.is_empty() {
            return Err(PolicyError("allow_job_types empty"));
        }
        if self.quiet_hours.enabled {
            self.quiet_hours.validate()?;
        }
        Ok(())
    }

    /// Decide whether `job` may fire for `tenant_id` at `now`.
    ///
    /// Checks run in order: tenant present, deny list, allow list, job type,
    /// quiet hours. The first rejection wins.
    pub fn decide(&self, now: DateTime<Utc>, tenant_id: &str, job: &CronJob) -> Decision {
        if !self.enabled {
            return Decision::allow(DecisionReason::PolicyDisabled);
        }

        let tenant_id = tenant_id.trim();
        if tenant_id.is_empty() {
            return Decision::deny(DecisionReason::MissingTenant);
        }
        if contains_ci(&self.deny_tenants, tenant_id) {
            return Decision::deny(DecisionReason::TenantDenied);
        }
        if !self.allow_tenants.is_empty() && !contains_ci(&self.allow_tenants, tenant_id) {
            return Decision::deny(DecisionReason::TenantNotAllowed);
        }
        if !contains_ci(&self.allow_job_types, job.effective_job_type()) {
            return Decision::deny(DecisionReason::JobTypeNotAllowed);
        }

        if self.quiet_hours.enabled {
            let decision = self.quiet_hours.evaluate(now);
            if !decision.allowed {
                return decision.tagged("quiet_hours", "true");
            }
        }
        Decision::allow(DecisionReason::Allowed)
    }
}

fn contains_ci(list: &[String], value: &str) -> bool {
    list.iter().any(|item| item.trim().eq_ignore_ascii_case(value))
}
