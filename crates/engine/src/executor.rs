//! Workflow execution engine.
//!
//! `Executor` is the central orchestrator for one graph run:
//! 1. Validates the graph and produces a topological ordering.
//! 2. Iterates through nodes in order, resolving a `StepHandler` by kind.
//! 3. Runs each handler under a per-step timeout derived from the caller's
//!    cancellation token.
//! 4. Appends `start` / `ok` / `error` / `skip` events to the run's trace.
//!
//! The executor never retries a step; redelivering the whole job is the
//! queue consumer's job.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use nodes::{ExecContext, Node, Registry, StepError, StepHandler, TraceEvent, TraceStatus};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::logging::{log_fields, EventLogger, LogLevel, TracingLogger};
use crate::{ExecError, ExecutionFailure, Graph};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// What happens to the rest of the run when a step fails or has no handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureMode {
    /// Stop at the first failing step and return its error.
    #[default]
    HardFail,
    /// Record the failure in the trace and move on to the next step.
    Continue,
}

/// Tuning knobs for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Upper bound on a single step's run time.
    pub step_timeout: Duration,
    pub failure_mode: FailureMode,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(120),
            failure_mode: FailureMode::HardFail,
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Runs compiled graphs against a handler registry.
///
/// Holds no per-run state, so one executor can serve any number of concurrent
/// runs; each run owns its own `ExecContext`.
pub struct Executor {
    registry: Arc<dyn Registry>,
    logger: Arc<dyn EventLogger>,
    config: ExecutorConfig,
}

impl Executor {
    /// Create a new executor that logs through `tracing`.
    pub fn new(registry: Arc<dyn Registry>, config: ExecutorConfig) -> Self {
        Self {
            registry,
            logger: Arc::new(TracingLogger),
            config,
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn EventLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run the graph and return the final context.
    ///
    /// # Errors
    /// An [`ExecutionFailure`] carrying the [`ExecError`] and the context as it
    /// stood when the run stopped (partial trace included). In
    /// [`FailureMode::Continue`] only an invalid graph or cancellation stops
    /// the run.
    #[instrument(skip_all, fields(tenant_id = %ctx.tenant_id, job_id = %ctx.job_id))]
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        graph: &Graph,
        mut ctx: ExecContext,
    ) -> Result<ExecContext, ExecutionFailure> {
        let order = match graph.validated_order() {
            Ok(order) => order,
            Err(e) => return Err(ExecutionFailure::new(e.into(), ctx)),
        };
        debug!(steps = order.len(), "graph validated");

        ctx.trace.reserve(order.len() * 2);

        for node_id in &order {
            if cancel.is_cancelled() {
                return Err(ExecutionFailure::new(ExecError::Cancelled, ctx));
            }

            let Some(node) = graph.node(node_id) else {
                continue;
            };

            push_trace(&mut ctx, node, TraceStatus::Start, 0, None);

            let Some(handler) = self.resolve(&node.kind) else {
                self.logger.log(
                    LogLevel::Warn,
                    "step_no_handler",
                    self.step_fields(&ctx, node, None, None),
                );
                let err = ExecError::NoHandler {
                    step_id: node.id.clone(),
                    kind: node.kind.clone(),
                };
                push_trace(&mut ctx, node, TraceStatus::Skip, 0, Some(err.to_string()));

                match self.config.failure_mode {
                    FailureMode::HardFail => return Err(ExecutionFailure::new(err, ctx)),
                    FailureMode::Continue => continue,
                }
            };

            // Handlers get a trace-less copy; the trace stays with the executor.
            let trace = std::mem::take(&mut ctx.trace);
            let started = Instant::now();
            let outcome = self.run_step(cancel, handler.as_ref(), node, ctx.clone()).await;
            let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

            match outcome {
                Ok(next) => {
                    ctx = next;
                    ctx.trace = trace;
                    push_trace(&mut ctx, node, TraceStatus::Ok, duration_ms, None);
                    self.logger.log(
                        LogLevel::Info,
                        "step_ok",
                        self.step_fields(&ctx, node, Some(duration_ms), None),
                    );
                }
                Err(err) => {
                    ctx.trace = trace;
                    let msg = err.to_string();
                    push_trace(&mut ctx, node, TraceStatus::Error, duration_ms, Some(msg.clone()));
                    self.logger.log(
                        LogLevel::Error,
                        "step_error",
                        self.step_fields(&ctx, node, Some(duration_ms), Some(msg)),
                    );

                    if err.is_cancelled() || self.config.failure_mode == FailureMode::HardFail {
                        return Err(ExecutionFailure::new(err, ctx));
                    }
                }
            }
        }

        Ok(ctx)
    }

    /// Case-insensitive lookup first, then the kind exactly as written.
    fn resolve(&self, kind: &str) -> Option<Arc<dyn StepHandler>> {
        let key = kind.trim().to_lowercase();
        self.registry.get(&key).or_else(|| self.registry.get(kind))
    }

    async fn run_step(
        &self,
        cancel: &CancellationToken,
        handler: &dyn StepHandler,
        node: &Node,
        ctx: ExecContext,
    ) -> Result<ExecContext, ExecError> {
        let step_cancel = cancel.child_token();
        let timeout = self.config.step_timeout;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ExecError::Cancelled),
            res = tokio::time::timeout(timeout, handler.run(step_cancel.clone(), node, ctx)) => res,
        };

        match result {
            Ok(Ok(out)) => Ok(out),
            Ok(Err(StepError::Cancelled)) if cancel.is_cancelled() => Err(ExecError::Cancelled),
            Ok(Err(source)) => Err(ExecError::StepFailed {
                step_id: node.id.clone(),
                source,
            }),
            Err(_elapsed) => {
                step_cancel.cancel();
                Err(ExecError::StepTimeout {
                    step_id: node.id.clone(),
                    timeout,
                })
            }
        }
    }

    fn step_fields(
        &self,
        ctx: &ExecContext,
        node: &Node,
        duration_ms: Option<u64>,
        error: Option<String>,
    ) -> crate::logging::LogFields {
        let mut fields = log_fields([
            ("tenant_id", json!(ctx.tenant_id)),
            ("job_id", json!(ctx.job_id)),
            ("source_id", json!(ctx.source_id)),
            ("step_id", json!(node.id)),
            ("kind", json!(node.kind)),
        ]);
        if let Some(ms) = duration_ms {
            fields.insert("duration_ms".into(), json!(ms));
        }
        if let Some(err) = error {
            fields.insert("error".into(), json!(err));
        }
        fields
    }
}

fn push_trace(
    ctx: &mut ExecContext,
    node: &Node,
    status: TraceStatus,
    duration_ms: u64,
    error: Option<String>,
) {
    ctx.trace.push(TraceEvent {
        ts: Utc::now(),
        step_id: node.id.clone(),
        kind: node.kind.clone(),
        status,
        duration_ms,
        error,
    });
}
