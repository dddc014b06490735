//! The trigger engine: polls cron schedules and enqueues the ones that are due.
//!
//! Each tick:
//! 1. List schedules from the [`JobsProvider`]; skip disabled or invalid ones.
//! 2. Look up (or compute) the schedule's next run.
//! 3. If it falls within the lookahead window and has not fired for that
//!    minute, gate it through the admission policy and the limiter.
//! 4. Enqueue through the [`Enqueuer`] and precompute the following run.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use engine::logging::{log_fields, EventLogger, LogFields, LogLevel, TracingLogger};
use queue::{Job, Publisher};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::cron::{next_run, resolve_timezone};
use crate::{AdmissionPolicy, CronJob, Limiter};

/// Caches are cleared outright once they grow past this many entries.
const MAX_CACHE_ENTRIES: usize = 5000;

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// Supplies the current set of schedules.
#[async_trait]
pub trait JobsProvider: Send + Sync {
    async fn list(&self, cancel: &CancellationToken) -> anyhow::Result<Vec<CronJob>>;
}

#[async_trait]
impl JobsProvider for Vec<CronJob> {
    async fn list(&self, _cancel: &CancellationToken) -> anyhow::Result<Vec<CronJob>> {
        Ok(self.clone())
    }
}

/// What a fired schedule asks to have run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobRequest {
    pub source_id: String,
    pub job_type: String,
    /// Name of the schedule that fired.
    pub schedule: String,
    pub scheduled_at: DateTime<Utc>,
}

/// Hands a fired job to whatever runs it; returns the new job's id.
#[async_trait]
pub trait Enqueuer: Send + Sync {
    async fn enqueue(&self, tenant_id: &str, request: JobRequest) -> anyhow::Result<String>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Enqueues onto a job queue, minting a UUIDv4 job id.
pub struct QueueEnqueuer<P> {
    publisher: P,
}

impl<P: Publisher> QueueEnqueuer<P> {
    pub fn new(publisher: P) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl<P: Publisher> Enqueuer for QueueEnqueuer<P> {
    async fn enqueue(&self, tenant_id: &str, request: JobRequest) -> anyhow::Result<String> {
        let job_id = Uuid::new_v4().to_string();
        let job = Job::new(&job_id, tenant_id, request.source_id, request.job_type)
            .with_payload("schedule", request.schedule)
            .with_payload("scheduled_at", request.scheduled_at.to_rfc3339());
        self.publisher.publish(job).await?;
        Ok(job_id)
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TriggerConfig {
    /// Pause between ticks.
    pub poll_interval: Duration,
    /// How far ahead of its scheduled minute a run may be enqueued.
    pub max_lookahead: Duration,
    /// Timezone for schedules that do not name one.
    pub default_timezone: Tz,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            max_lookahead: Duration::from_secs(5 * 60),
            default_timezone: Tz::UTC,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ScheduleKey {
    tenant: String,
    name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FiredKey {
    schedule: ScheduleKey,
    minute: i64,
}

#[derive(Debug, Default)]
struct TriggerState {
    next_run: HashMap<ScheduleKey, DateTime<Utc>>,
    fired: HashSet<FiredKey>,
}

pub struct TriggerEngine {
    provider: Arc<dyn JobsProvider>,
    enqueuer: Arc<dyn Enqueuer>,
    policy: AdmissionPolicy,
    limiter: Limiter,
    clock: Arc<dyn Clock>,
    logger: Arc<dyn EventLogger>,
    config: TriggerConfig,
    state: Mutex<TriggerState>,
}

impl TriggerEngine {
    pub fn new(
        provider: Arc<dyn JobsProvider>,
        enqueuer: Arc<dyn Enqueuer>,
        policy: AdmissionPolicy,
        config: TriggerConfig,
    ) -> Self {
        Self {
            provider,
            enqueuer,
            limiter: Limiter::new(policy.clone()),
            policy,
            clock: Arc::new(SystemClock),
            logger: Arc::new(TracingLogger),
            config,
            state: Mutex::new(TriggerState::default()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn EventLogger>) -> Self {
        self.logger = logger;
        self
    }

    /// Tick every `poll_interval` until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(poll_interval = ?self.config.poll_interval, "trigger engine started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            self.tick(&cancel).await;

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        self.logger.log(LogLevel::Info, "trigger_engine_stop", LogFields::new());
    }

    /// Evaluate every schedule once. Returns how many jobs were enqueued.
    #[instrument(skip_all)]
    pub async fn tick(&self, cancel: &CancellationToken) -> usize {
        let now = self.clock.now();

        let jobs = match self.provider.list(cancel).await {
            Ok(jobs) => jobs,
            Err(e) => {
                self.logger.log(
                    LogLevel::Warn,
                    "jobs_provider_error",
                    log_fields([("error", json!(format!("{e:#}")))]),
                );
                return 0;
            }
        };

        self.prune_caches();

        let mut fired = 0;
        for job in jobs.iter().filter(|j| j.enabled) {
            if cancel.is_cancelled() {
                break;
            }
            if self.evaluate(now, job).await {
                fired += 1;
            }
        }
        debug!(schedules = jobs.len(), fired, "tick complete");
        fired
    }

    async fn evaluate(&self, now: DateTime<Utc>, job: &CronJob) -> bool {
        if let Err(e) = job.validate() {
            let mut fields = schedule_fields(job);
            fields.insert("error".into(), json!(e.to_string()));
            self.logger.log(LogLevel::Warn, "cron_job_invalid", fields);
            return false;
        }

        let tz = resolve_timezone(&job.timezone, self.config.default_timezone);
        let key = ScheduleKey {
            tenant: job.tenant_id.clone(),
            name: job.name.clone(),
        };

        let scheduled_at = match self.cached_next_run(&key) {
            Some(at) if at >= now - chrono::Duration::minutes(1) => at,
            _ => match next_run(now, &job.cron_expr, tz) {
                Ok(at) => {
                    self.lock().next_run.insert(key.clone(), at);
                    at
                }
                Err(e) => {
                    let mut fields = schedule_fields(job);
                    fields.insert("error".into(), json!(e.to_string()));
                    self.logger.log(LogLevel::Warn, "next_run_error", fields);
                    return false;
                }
            },
        };

        if scheduled_at > now + self.lookahead() {
            return false;
        }

        let fired_key = FiredKey {
            schedule: key.clone(),
            minute: scheduled_at.timestamp().div_euclid(60),
        };
        if self.lock().fired.contains(&fired_key) {
            return false;
        }

        let mut fields = schedule_fields(job);
        fields.insert("job_type".into(), json!(job.effective_job_type()));
        fields.insert(
            "scheduled_at".into(),
            json!(scheduled_at.with_timezone(&tz).to_rfc3339()),
        );

        let mut decision = self.policy.decide(scheduled_at, &job.tenant_id, job);
        if decision.allowed {
            decision = self.limiter.allow(now, &job.tenant_id, &job.name);
        }
        if !decision.allowed {
            fields.insert("reason".into(), json!(decision.reason.as_str()));
            self.logger.log(LogLevel::Debug, "trigger_suppressed", fields);
            self.advance(key, fired_key, scheduled_at, &job.cron_expr, tz);
            return false;
        }

        let request = JobRequest {
            source_id: job.source_id.clone(),
            job_type: job.effective_job_type().to_owned(),
            schedule: job.name.clone(),
            scheduled_at,
        };
        match self.enqueuer.enqueue(&job.tenant_id, request).await {
            Ok(job_id) => {
                fields.insert("job_id".into(), json!(job_id));
                self.logger.log(LogLevel::Info, "trigger_fired", fields);
                self.advance(key, fired_key, scheduled_at, &job.cron_expr, tz);
                true
            }
            Err(e) => {
                // Left unmarked so the next tick tries again.
                fields.insert("error".into(), json!(format!("{e:#}")));
                self.logger.log(LogLevel::Warn, "trigger_enqueue_error", fields);
                false
            }
        }
    }

    /// Mark `scheduled_at` as handled and cache the run after it.
    fn advance(&self, key: ScheduleKey, fired: FiredKey, scheduled_at: DateTime<Utc>, expr: &str, tz: Tz) {
        let following = next_run(scheduled_at, expr, tz).ok();
        let mut state = self.lock();
        state.fired.insert(fired);
        match following {
            Some(at) => state.next_run.insert(key, at),
            None => state.next_run.remove(&key),
        };
    }

    fn cached_next_run(&self, key: &ScheduleKey) -> Option<DateTime<Utc>> {
        self.lock().next_run.get(key).copied()
    }

    fn prune_caches(&self) {
        let mut state = self.lock();
        if state.fired.len() > MAX_CACHE_ENTRIES {
            state.fired.clear();
        }
        if state.next_run.len() > MAX_CACHE_ENTRIES {
            state.next_run.clear();
        }
    }

    fn lookahead(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.max_lookahead).unwrap_or_else(|_| chrono::Duration::days(366))
    }

    fn lock(&self) -> MutexGuard<'_, TriggerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn schedule_fields(job: &CronJob) -> LogFields {
    log_fields([
        ("tenant_id", json!(job.tenant_id)),
        ("name", json!(job.name)),
        ("source_id", json!(job.source_id)),
    ])
}
