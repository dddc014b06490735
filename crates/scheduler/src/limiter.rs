//! In-memory trigger rate limiter.
//!
//! Two counters guarded by one mutex: a global count per UTC minute and a
//! count per `(tenant, job, UTC hour)`. Old buckets are pruned inline on each
//! call, so memory stays bounded without a background timer.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};

use crate::{AdmissionPolicy, Decision, DecisionReason};

/// Minute buckets older than this many minutes are dropped.
const MINUTE_RETENTION: i64 = 5;
/// Hour buckets older than this many hours are dropped.
const HOUR_RETENTION: i64 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct JobHourKey {
    tenant: String,
    job: String,
    hour: i64,
}

#[derive(Debug, Default)]
struct Counters {
    per_minute: HashMap<i64, u32>,
    per_job_hour: HashMap<JobHourKey, u32>,
    last_pruned_minute: Option<i64>,
    last_pruned_hour: Option<i64>,
}

impl Counters {
    fn prune(&mut self, minute: i64, hour: i64) {
        if self.last_pruned_minute.map_or(true, |last| minute - last >= 2) {
            self.per_minute.retain(|&m, _| m >= minute - MINUTE_RETENTION);
            self.last_pruned_minute = Some(minute);
        }
        if self.last_pruned_hour.map_or(true, |last| hour - last >= 1) {
            self.per_job_hour.retain(|k, _| k.hour >= hour - HOUR_RETENTION);
            self.last_pruned_hour = Some(hour);
        }
    }
}

/// Enforces the policy's rate thresholds. Safe to share across tasks.
#[derive(Debug)]
pub struct Limiter {
    policy: AdmissionPolicy,
    counters: Mutex<Counters>,
}

impl Limiter {
    pub fn new(policy: AdmissionPolicy) -> Self {
        Self {
            policy,
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn policy(&self) -> &AdmissionPolicy {
        &self.policy
    }

    /// Check both thresholds and, if neither is reached, count the trigger.
    ///
    /// A rejection leaves every counter untouched. Tenant and job names
    /// compare case-insensitively.
    pub fn allow(&self, now: DateTime<Utc>, tenant_id: &str, job_name: &str) -> Decision {
        if !self.policy.enabled {
            return Decision::allow(DecisionReason::PolicyDisabled);
        }
        let (minute, hour) = buckets(now);
        let key = JobHourKey {
            tenant: tenant_id.to_lowercase(),
            job: job_name.to_lowercase(),
            hour,
        };

        let mut counters = self.lock();
        counters.prune(minute, hour);

        if counters.per_minute.get(&minute).copied().unwrap_or(0) >= self.policy.max_triggers_per_minute {
            return Decision::deny(DecisionReason::RateLimitedMinute);
        }
        if counters.per_job_hour.get(&key).copied().unwrap_or(0) >= self.policy.max_triggers_per_job_per_hour {
            return Decision::deny(DecisionReason::RateLimitedJobHour);
        }

        *counters.per_minute.entry(minute).or_default() += 1;
        *counters.per_job_hour.entry(key).or_default() += 1;
        Decision::allow(DecisionReason::Allowed)
    }

    /// Prune stale buckets relative to `now` without counting anything.
    pub fn reset_old(&self, now: DateTime<Utc>) {
        let (minute, hour) = buckets(now);
        self.lock().prune(minute, hour);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn buckets(now: DateTime<Utc>) -> (i64, i64) {
    let secs = now.timestamp();
    (secs.div_euclid(60), secs.div_euclid(3600))
}
