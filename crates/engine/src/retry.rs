//! Retry policy: exponential backoff with a cap and deterministic jitter.
//!
//! The jitter factor is derived from an FNV-1a hash of `"<job_id>:<attempt>"`
//! rather than a random source, so the same job and attempt always back off by
//! the same amount.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::RetryPolicyError;

const FALLBACK_INITIAL_DELAY: Duration = Duration::from_millis(250);
const FALLBACK_MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub enabled: bool,
    /// Highest 1-based attempt that may be scheduled; `0` means unbounded.
    pub max_attempts: u32,
    #[serde(with = "duration_ms", rename = "initial_delay_ms")]
    pub initial_delay: Duration,
    #[serde(with = "duration_ms", rename = "max_delay_ms")]
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Jitter spread in `[0, 1)`; `0` keeps delays fully deterministic.
    pub jitter_pct: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            initial_delay: FALLBACK_INITIAL_DELAY,
            max_delay: FALLBACK_MAX_DELAY,
            multiplier: 2.0,
            jitter_pct: 0.0,
        }
    }
}

/// Why a retry was not scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    Disabled,
    InvalidAttempt,
    MaxAttemptsExceeded,
    InvalidPolicy,
}

impl GiveUpReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled            => "disabled",
            Self::InvalidAttempt      => "invalid_attempt",
            Self::MaxAttemptsExceeded => "max_attempts_exceeded",
            Self::InvalidPolicy       => "invalid_policy",
        }
    }
}

impl fmt::Display for GiveUpReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`RetryPolicy::next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration, jittered: bool },
    GiveUp(GiveUpReason),
}

impl RetryDecision {
    /// The delay to wait, or `None` when no retry should happen.
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Self::Retry { delay, .. } => Some(*delay),
            Self::GiveUp(_) => None,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::Retry { jittered: false, .. } => "ok",
            Self::Retry { jittered: true, .. } => "ok_jittered",
            Self::GiveUp(reason) => reason.as_str(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// # Errors
    /// [`RetryPolicyError`] naming the offending field.
    pub fn validate(&self) -> Result<(), RetryPolicyError> {
        if !self.multiplier.is_finite() || (self.multiplier < 1.0 && self.max_attempts > 0) {
            return Err(RetryPolicyError("multiplier"));
        }
        if !(0.0..1.0).contains(&self.jitter_pct) {
            return Err(RetryPolicyError("jitter_pct"));
        }
        if !self.max_delay.is_zero() && self.initial_delay > self.max_delay {
            return Err(RetryPolicyError("initial_delay > max_delay"));
        }
        Ok(())
    }

    /// Delay before the given 1-based attempt.
    pub fn next(&self, job_id: &str, attempt: u32) -> RetryDecision {
        if !self.enabled {
            return RetryDecision::GiveUp(GiveUpReason::Disabled);
        }
        if attempt == 0 {
            return RetryDecision::GiveUp(GiveUpReason::InvalidAttempt);
        }
        if self.max_attempts > 0 && attempt > self.max_attempts {
            return RetryDecision::GiveUp(GiveUpReason::MaxAttemptsExceeded);
        }
        if self.validate().is_err() {
            return RetryDecision::GiveUp(GiveUpReason::InvalidPolicy);
        }

        let base = if self.initial_delay.is_zero() {
            FALLBACK_INITIAL_DELAY
        } else {
            self.initial_delay
        };
        let cap = if self.max_delay.is_zero() {
            FALLBACK_MAX_DELAY
        } else {
            self.max_delay
        };

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let raw = scale(base, self.multiplier.powi(exponent), cap);

        if self.jitter_pct <= 0.0 {
            return RetryDecision::Retry {
                delay: raw,
                jittered: false,
            };
        }

        let factor = 1.0 + (2.0 * unit_hash(job_id, attempt) - 1.0) * self.jitter_pct;
        RetryDecision::Retry {
            delay: scale(raw, factor, cap),
            jittered: true,
        }
    }
}

/// `base * factor` truncated to whole nanoseconds, clamped to `[0, cap]`.
fn scale(base: Duration, factor: f64, cap: Duration) -> Duration {
    let nanos = (base.as_nanos() as f64 * factor).trunc();
    if !nanos.is_finite() || nanos >= cap.as_nanos() as f64 {
        return cap;
    }
    Duration::from_nanos(nanos.max(0.0) as u64)
}

/// Maps `(job_id, attempt)` to `[0, 1)` via FNV-1a 64.
fn unit_hash(job_id: &str, attempt: u32) -> f64 {
    let job_id = match job_id.trim() {
        "" => "unknown",
        trimmed => trimmed,
    };
    let key = format!("{job_id}:{attempt}");
    let sum = fnv1a64(key.as_bytes());
    (sum % 1_000_000) as f64 / 1_000_000.0
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    bytes.iter().fold(OFFSET_BASIS, |hash, &b| {
        (hash ^ u64::from(b)).wrapping_mul(PRIME)
    })
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
