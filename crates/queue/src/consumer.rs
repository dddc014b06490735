//! The worker pool that drains a [`Source`].
//!
//! Each worker loops:
//! 1. Pull the next envelope; on `Empty` sleep with exponential idle backoff,
//!    on `Closed` exit, on any other source error log and back off briefly.
//! 2. Drop structurally invalid envelopes with a logged reason.
//! 3. Invoke the [`JobHandler`]; on failure ask the [`RetrySchedule`] for the
//!    next delay and redeliver, or give up and log a terminal failure.
//!
//! One job's permanent failure never stops the worker from taking the next one.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use engine::logging::{log_fields, EventLogger, LogFields, LogLevel, TracingLogger};
use engine::{RetryDecision, RetryPolicy};
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{Envelope, Publisher, QueueError, Source, SourceError};

/// Processes one dequeued job. Implementations should be idempotent: a job
/// may be handled more than once.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, cancel: &CancellationToken, envelope: &Envelope) -> anyhow::Result<()>;
}

/// Decides whether, and after how long, a failed job is redelivered.
pub trait RetrySchedule: Send + Sync {
    /// `attempt` is the 1-based attempt about to be scheduled.
    fn next(&self, job_id: &str, attempt: u32) -> RetryDecision;
}

impl RetrySchedule for RetryPolicy {
    fn next(&self, job_id: &str, attempt: u32) -> RetryDecision {
        RetryPolicy::next(self, job_id, attempt)
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// How a failed job gets its next attempt.
#[derive(Clone, Default)]
pub enum Redelivery {
    /// Re-dispatch the same envelope on the same worker after the delay.
    /// Nothing survives a restart; suited to in-memory queues.
    #[default]
    InProcess,
    /// Publish the job again with the incremented attempt and let the source
    /// redeliver it.
    Republish(Arc<dyn Publisher>),
}

impl fmt::Debug for Redelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InProcess    => f.write_str("InProcess"),
            Self::Republish(_) => f.write_str("Republish"),
        }
    }
}

/// Tuning knobs for the consumer.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Number of worker loops.
    pub concurrency: usize,
    /// First sleep after an empty poll; also where the backoff resets to.
    pub idle_backoff_floor: Duration,
    /// Ceiling for the doubling idle backoff.
    pub idle_backoff_max: Duration,
    /// Pause after an unexpected source error.
    pub source_error_backoff: Duration,
    pub redelivery: Redelivery,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            idle_backoff_floor: Duration::from_millis(100),
            idle_backoff_max: Duration::from_secs(1),
            source_error_backoff: Duration::from_millis(250),
            redelivery: Redelivery::InProcess,
        }
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

pub struct Consumer {
    source: Arc<dyn Source>,
    handler: Arc<dyn JobHandler>,
    retry: Option<Arc<dyn RetrySchedule>>,
    logger: Arc<dyn EventLogger>,
    config: ConsumerConfig,
    stop: CancellationToken,
    started: AtomicBool,
    /// Handles stay here until their worker has exited, so a timed-out
    /// `stop` can be followed by another `stop` or `join`.
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Consumer {
    /// Create a consumer without a retry schedule: every failure is terminal
    /// until [`Consumer::with_retry`] says otherwise.
    pub fn new(source: Arc<dyn Source>, handler: Arc<dyn JobHandler>, config: ConsumerConfig) -> Self {
        Self {
            source,
            handler,
            retry: None,
            logger: Arc::new(TracingLogger),
            config,
            stop: CancellationToken::new(),
            started: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_retry(mut self, retry: Arc<dyn RetrySchedule>) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn EventLogger>) -> Self {
        self.logger = logger;
        self
    }

    /// Launch `concurrency` workers. `cancel` governs the whole pool and is
    /// handed to the job handler.
    pub fn start(&self, cancel: &CancellationToken) -> Result<(), QueueError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(QueueError::AlreadyStarted);
        }
        let Ok(mut workers) = self.workers.try_lock() else {
            return Err(QueueError::AlreadyStarted);
        };

        let concurrency = self.config.concurrency.max(1);
        info!(concurrency, "starting consumer");

        workers.extend((0..concurrency).map(|worker_id| {
            let worker = Worker {
                id: worker_id,
                source: Arc::clone(&self.source),
                handler: Arc::clone(&self.handler),
                retry: self.retry.clone(),
                logger: Arc::clone(&self.logger),
                config: self.config.clone(),
                cancel: cancel.clone(),
                stop: self.stop.clone(),
            };
            tokio::spawn(worker.run())
        }));
        Ok(())
    }

    /// Signal every worker to stop and wait up to `deadline` for them to
    /// finish their in-flight jobs.
    ///
    /// # Errors
    /// [`QueueError::StopTimeout`] if some worker is still busy at the deadline.
    pub async fn stop(&self, deadline: Duration) -> Result<(), QueueError> {
        self.stop.cancel();
        tokio::time::timeout(deadline, self.join())
            .await
            .map_err(|_| QueueError::StopTimeout(deadline))
    }

    /// Wait until every worker has exited (source closed, stop, or cancel).
    ///
    /// A handle is only released once its worker is done; dropping this
    /// future early leaves the rest in place for the next call.
    pub async fn join(&self) {
        let mut workers = self.workers.lock().await;
        while let Some(handle) = workers.last_mut() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "consumer worker panicked");
            }
            workers.pop();
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct Worker {
    id: usize,
    source: Arc<dyn Source>,
    handler: Arc<dyn JobHandler>,
    retry: Option<Arc<dyn RetrySchedule>>,
    logger: Arc<dyn EventLogger>,
    config: ConsumerConfig,
    cancel: CancellationToken,
    stop: CancellationToken,
}

impl Worker {
    async fn run(self) {
        let mut idle_backoff = self.config.idle_backoff_floor;

        loop {
            if self.halted() {
                return;
            }

            let env = match self.source.next(&self.cancel).await {
                Ok(env) => env,
                Err(SourceError::Closed) => {
                    self.logger.log(
                        LogLevel::Info,
                        "source_closed",
                        log_fields([("worker_id", json!(self.id))]),
                    );
                    return;
                }
                Err(SourceError::Cancelled) => return,
                Err(SourceError::Empty) => {
                    if !self.pause(idle_backoff).await {
                        return;
                    }
                    idle_backoff = (idle_backoff * 2).min(self.config.idle_backoff_max);
                    continue;
                }
                Err(SourceError::Other(e)) => {
                    self.logger.log(
                        LogLevel::Warn,
                        "source_error",
                        log_fields([
                            ("worker_id", json!(self.id)),
                            ("error", json!(format!("{e:#}"))),
                        ]),
                    );
                    if !self.pause(self.config.source_error_backoff).await {
                        return;
                    }
                    continue;
                }
            };
            idle_backoff = self.config.idle_backoff_floor;

            if let Err(e) = env.validate() {
                self.logger.log(
                    LogLevel::Warn,
                    "dropped_envelope",
                    log_fields([
                        ("worker_id", json!(self.id)),
                        ("reason", json!(e.to_string())),
                        ("type", json!(env.kind)),
                        ("version", json!(env.version)),
                        ("tenant_id", json!(env.job.tenant_id)),
                        ("job_id", json!(env.job.job_id)),
                    ]),
                );
                continue;
            }

            self.logger.log(LogLevel::Info, "job_dequeued", self.job_fields(&env));
            self.handle_with_retry(env).await;
        }
    }

    async fn handle_with_retry(&self, mut env: Envelope) {
        loop {
            if self.halted() {
                return;
            }

            let started = Instant::now();
            let result = self.handler.handle(&self.cancel, &env).await;
            let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

            let Err(err) = result else {
                let mut fields = self.job_fields(&env);
                fields.insert("duration_ms".into(), json!(duration_ms));
                self.logger.log(LogLevel::Info, "job_handled", fields);
                return;
            };

            let next_attempt = env.job.attempt.saturating_add(1);
            let (delay, reason) = match &self.retry {
                Some(retry) => {
                    let decision = retry.next(&env.job.job_id, next_attempt);
                    match decision.delay() {
                        Some(d) if d.is_zero() => (None, "zero_delay"),
                        delay => (delay, decision.reason()),
                    }
                }
                None => (None, "no_retry_policy"),
            };

            let mut fields = self.job_fields(&env);
            fields.insert("duration_ms".into(), json!(duration_ms));
            fields.insert("error".into(), json!(format!("{err:#}")));
            fields.insert("reason".into(), json!(reason));

            let Some(delay) = delay else {
                self.logger.log(LogLevel::Error, "job_terminal_failure", fields);
                return;
            };

            fields.insert("attempt".into(), json!(next_attempt));
            fields.insert("delay_ms".into(), json!(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)));
            self.logger.log(LogLevel::Warn, "job_retry_scheduled", fields);

            if !self.pause(delay).await {
                debug!(job_id = %env.job.job_id, "retry abandoned on shutdown");
                return;
            }
            env.job.attempt = next_attempt;

            if let Redelivery::Republish(publisher) = &self.config.redelivery {
                if let Err(e) = publisher.publish(env.job.clone()).await {
                    let mut fields = self.job_fields(&env);
                    fields.insert("error".into(), json!(e.to_string()));
                    fields.insert("reason".into(), json!("republish_failed"));
                    self.logger.log(LogLevel::Error, "job_terminal_failure", fields);
                }
                return;
            }
        }
    }

    fn halted(&self) -> bool {
        self.cancel.is_cancelled() || self.stop.is_cancelled()
    }

    /// Sleep unless stopped first; `false` means the worker should exit.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = self.stop.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn job_fields(&self, env: &Envelope) -> LogFields {
        log_fields([
            ("worker_id", json!(self.id)),
            ("tenant_id", json!(env.job.tenant_id)),
            ("job_id", json!(env.job.job_id)),
            ("source_id", json!(env.job.source_id)),
            ("job_type", json!(env.job.job_type)),
            ("attempt", json!(env.job.attempt)),
        ])
    }
}
