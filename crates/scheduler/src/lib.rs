//! `scheduler` crate — cron schedules, admission control, and the trigger loop
//! that turns due schedules into queued jobs.
//!
//! Nothing here executes work: a fired trigger only enqueues a job, which the
//! queue consumer later picks up.

pub mod error;
pub mod cron;
pub mod admission;
pub mod limiter;
pub mod trigger;

pub use admission::{AdmissionPolicy, Decision, DecisionReason, QuietHours, QuietMode};
pub use cron::{next_run, resolve_timezone, validate_cron_expr, CronJob, CronSchedule, DEFAULT_JOB_TYPE};
pub use error::{CronError, PolicyError};
pub use limiter::Limiter;
pub use trigger::{
    Clock, Enqueuer, JobRequest, JobsProvider, QueueEnqueuer, SystemClock, TriggerConfig, TriggerEngine,
};
