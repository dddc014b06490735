//! Scheduler error types.
//!
//! Both are construction errors: they surface when schedules and policies are
//! loaded, never while triggers are being evaluated.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid field: unknown timezone '{0}'")]
    InvalidTimezone(String),

    #[error("invalid cron expression: expected 5 fields, got {0}")]
    FieldCount(usize),

    /// `index` is the 0-based field position (minute, hour, dom, month, dow).
    #[error("invalid cron expression: field {index} ({name}): {reason}")]
    InvalidField {
        index: usize,
        name: &'static str,
        reason: &'static str,
    },

    #[error("invalid cron expression: no run found within 366 days")]
    NoRunFound,
}

/// An admission policy that failed validation; carries the offending field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("policy invalid: {0}")]
pub struct PolicyError(pub &'static str);
