//! Tests for the consumer worker pool.
//!
//! Everything runs on paused tokio time, so retry delays and idle backoff
//! cost nothing in wall-clock terms.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use engine::logging::RecordingLogger;
use engine::{Executor, ExecutorConfig, JobPlan, PlanCatalog, PlanStep, RetryDecision, RetryPolicy};
use nodes::mock::MockHandler;
use nodes::{ExecContext, HandlerRegistry, Node, StepError, StepHandler};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::{
    in_memory, Consumer, ConsumerConfig, Envelope, Job, JobHandler, Publisher, QueueError, Redelivery, RetrySchedule,
    Source, SourceError, WorkflowJobHandler,
};

// ============================================================================
// Helpers
// ============================================================================

/// Fails the first `failures` calls, then succeeds. Records the attempt
/// number of every envelope it sees.
struct ScriptedHandler {
    failures: usize,
    calls: AtomicUsize,
    attempts: Mutex<Vec<(String, u32)>>,
}

impl ScriptedHandler {
    fn failing_first(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicUsize::new(0),
            attempts: Mutex::new(Vec::new()),
        })
    }

    fn always_failing() -> Arc<Self> {
        Self::failing_first(usize::MAX)
    }

    fn succeeding() -> Arc<Self> {
        Self::failing_first(0)
    }

    fn attempts(&self) -> Vec<u32> {
        self.attempts.lock().unwrap().iter().map(|(_, a)| *a).collect()
    }

    fn job_ids(&self) -> Vec<String> {
        self.attempts.lock().unwrap().iter().map(|(id, _)| id.clone()).collect()
    }
}

#[async_trait]
impl JobHandler for ScriptedHandler {
    async fn handle(&self, _cancel: &CancellationToken, envelope: &Envelope) -> anyhow::Result<()> {
        self.attempts
            .lock()
            .unwrap()
            .push((envelope.job.job_id.clone(), envelope.job.attempt));
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            anyhow::bail!("boom #{n}");
        }
        Ok(())
    }
}

/// Sleeps without looking at the cancellation token.
#[derive(Default)]
struct StubbornHandler {
    finished: AtomicBool,
}

#[async_trait]
impl JobHandler for StubbornHandler {
    async fn handle(&self, _cancel: &CancellationToken, _envelope: &Envelope) -> anyhow::Result<()> {
        tokio::time::sleep(Duration::from_secs(10)).await;
        self.finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Always asks for an immediate retry.
struct ZeroDelaySchedule;

impl RetrySchedule for ZeroDelaySchedule {
    fn next(&self, _job_id: &str, _attempt: u32) -> RetryDecision {
        RetryDecision::Retry { delay: Duration::ZERO, jittered: false }
    }
}

/// Records the vars each step run sees.
#[derive(Default)]
struct VarsCapture {
    seen: Mutex<Vec<BTreeMap<String, String>>>,
}

#[async_trait]
impl StepHandler for VarsCapture {
    async fn run(&self, _cancel: CancellationToken, _node: &Node, ctx: ExecContext) -> Result<ExecContext, StepError> {
        self.seen.lock().unwrap().push(ctx.vars.clone());
        Ok(ctx)
    }
}

/// Reports a transport error once, then closes.
struct BrokenSource {
    polls: AtomicUsize,
}

#[async_trait]
impl Source for BrokenSource {
    async fn next(&self, _cancel: &CancellationToken) -> Result<Envelope, SourceError> {
        match self.polls.fetch_add(1, Ordering::SeqCst) {
            0 => Err(SourceError::Other(anyhow::anyhow!("connection reset"))),
            _ => Err(SourceError::Closed),
        }
    }
}

fn retry_policy(max_attempts: u32) -> Arc<RetryPolicy> {
    Arc::new(RetryPolicy {
        enabled: true,
        max_attempts,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(100),
        multiplier: 2.0,
        jitter_pct: 0.0,
    })
}

fn job(id: &str) -> Job {
    Job::new(id, "tenant-a", "src-1", "ingest")
}

async fn wait_for(logger: &RecordingLogger, event: &str, count: usize) {
    while logger.count(event) < count {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ============================================================================
// Retry handling
// ============================================================================

#[tokio::test(start_paused = true)]
async fn flaky_job_is_retried_until_it_succeeds() {
    let (publisher, source) = in_memory(8);
    publisher.publish(job("j1")).await.unwrap();
    drop(publisher);

    let handler = ScriptedHandler::failing_first(2);
    let logger = Arc::new(RecordingLogger::new());
    let consumer = Consumer::new(Arc::new(source), handler.clone(), ConsumerConfig::default())
        .with_retry(retry_policy(3))
        .with_logger(logger.clone());

    consumer.start(&CancellationToken::new()).unwrap();
    consumer.join().await;

    assert_eq!(handler.attempts(), vec![0, 1, 2]);
    assert_eq!(logger.count("job_dequeued"), 1);
    assert_eq!(logger.count("job_retry_scheduled"), 2);
    assert_eq!(logger.count("job_handled"), 1);
    assert_eq!(logger.count("job_terminal_failure"), 0);

    let delays: Vec<_> = logger
        .named("job_retry_scheduled")
        .into_iter()
        .map(|e| e.fields["delay_ms"].clone())
        .collect();
    assert_eq!(delays, vec![json!(10), json!(20)]);
}

#[tokio::test(start_paused = true)]
async fn persistent_failure_gives_up_after_max_attempts() {
    let (publisher, source) = in_memory(8);
    publisher.publish(job("j1")).await.unwrap();
    drop(publisher);

    let handler = ScriptedHandler::always_failing();
    let logger = Arc::new(RecordingLogger::new());
    let consumer = Consumer::new(Arc::new(source), handler.clone(), ConsumerConfig::default())
        .with_retry(retry_policy(3))
        .with_logger(logger.clone());

    consumer.start(&CancellationToken::new()).unwrap();
    consumer.join().await;

    assert_eq!(handler.attempts(), vec![0, 1, 2, 3]);
    assert_eq!(logger.count("job_retry_scheduled"), 3);

    let terminal = logger.named("job_terminal_failure");
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].fields["reason"], json!("max_attempts_exceeded"));
    assert_eq!(terminal[0].fields["error"], json!("boom #3"));
}

#[tokio::test(start_paused = true)]
async fn failure_without_retry_policy_is_terminal() {
    let (publisher, source) = in_memory(8);
    publisher.publish(job("j1")).await.unwrap();
    publisher.publish(job("j2")).await.unwrap();
    drop(publisher);

    let handler = ScriptedHandler::always_failing();
    let logger = Arc::new(RecordingLogger::new());
    let consumer = Consumer::new(Arc::new(source), handler.clone(), ConsumerConfig::default())
        .with_logger(logger.clone());

    consumer.start(&CancellationToken::new()).unwrap();
    consumer.join().await;

    // One job's permanent failure does not stop the worker.
    assert_eq!(handler.job_ids(), vec!["j1", "j2"]);
    let terminal = logger.named("job_terminal_failure");
    assert_eq!(terminal.len(), 2);
    assert!(terminal.iter().all(|e| e.fields["reason"] == json!("no_retry_policy")));
}

#[tokio::test(start_paused = true)]
async fn disabled_policy_reports_disabled() {
    let (publisher, source) = in_memory(8);
    publisher.publish(job("j1")).await.unwrap();
    drop(publisher);

    let logger = Arc::new(RecordingLogger::new());
    let consumer = Consumer::new(Arc::new(source), ScriptedHandler::always_failing(), ConsumerConfig::default())
        .with_retry(Arc::new(RetryPolicy::disabled()))
        .with_logger(logger.clone());

    consumer.start(&CancellationToken::new()).unwrap();
    consumer.join().await;

    let terminal = logger.named("job_terminal_failure");
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].fields["reason"], json!("disabled"));
}

#[tokio::test(start_paused = true)]
async fn republish_mode_sends_the_job_back_through_the_queue() {
    let (publisher, source) = in_memory(8);
    publisher.publish(job("j1")).await.unwrap();

    let handler = ScriptedHandler::failing_first(1);
    let logger = Arc::new(RecordingLogger::new());
    let config = ConsumerConfig {
        redelivery: Redelivery::Republish(Arc::new(publisher.clone())),
        ..ConsumerConfig::default()
    };
    let consumer = Consumer::new(Arc::new(source), handler.clone(), config)
        .with_retry(retry_policy(3))
        .with_logger(logger.clone());

    let cancel = CancellationToken::new();
    consumer.start(&cancel).unwrap();
    wait_for(&logger, "job_handled", 1).await;
    cancel.cancel();
    consumer.join().await;

    assert_eq!(handler.attempts(), vec![0, 1]);
    // The retry came back through the source, so it was dequeued twice.
    assert_eq!(logger.count("job_dequeued"), 2);
    assert_eq!(logger.count("job_retry_scheduled"), 1);
}

// ============================================================================
// Source behaviour
// ============================================================================

#[tokio::test(start_paused = true)]
async fn invalid_envelopes_are_dropped_and_the_worker_continues() {
    let (publisher, source) = in_memory(8);
    let mut bad = Envelope::new(job("bad"));
    bad.version = String::new();
    publisher.publish_envelope(bad).await.unwrap();
    publisher.publish(job("good")).await.unwrap();
    drop(publisher);

    let handler = ScriptedHandler::succeeding();
    let logger = Arc::new(RecordingLogger::new());
    let consumer = Consumer::new(Arc::new(source), handler.clone(), ConsumerConfig::default())
        .with_logger(logger.clone());

    consumer.start(&CancellationToken::new()).unwrap();
    consumer.join().await;

    assert_eq!(handler.job_ids(), vec!["good"]);
    let dropped = logger.named("dropped_envelope");
    assert_eq!(dropped.len(), 1);
    assert_eq!(dropped[0].fields["version"], json!(""));
    assert!(dropped[0].fields["reason"].as_str().unwrap().contains("missing version"));
    assert_eq!(dropped[0].fields["job_id"], json!("bad"));
}

#[tokio::test(start_paused = true)]
async fn source_errors_are_logged_and_polling_resumes() {
    let source = Arc::new(BrokenSource { polls: AtomicUsize::new(0) });
    let logger = Arc::new(RecordingLogger::new());
    let consumer = Consumer::new(source.clone(), ScriptedHandler::succeeding(), ConsumerConfig::default())
        .with_logger(logger.clone());

    consumer.start(&CancellationToken::new()).unwrap();
    consumer.join().await;

    let errors = logger.named("source_error");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].fields["error"], json!("connection reset"));
    assert_eq!(logger.count("source_closed"), 1);
    assert_eq!(source.polls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn idle_workers_pick_up_late_jobs() {
    let (publisher, source) = in_memory(8);
    let handler = ScriptedHandler::succeeding();
    let logger = Arc::new(RecordingLogger::new());
    let consumer = Consumer::new(Arc::new(source), handler.clone(), ConsumerConfig::default())
        .with_logger(logger.clone());

    consumer.start(&CancellationToken::new()).unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    publisher.publish(job("late")).await.unwrap();
    drop(publisher);
    consumer.join().await;

    assert_eq!(handler.job_ids(), vec!["late"]);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test(start_paused = true)]
async fn concurrent_workers_handle_every_job_once() {
    let (publisher, source) = in_memory(32);
    for i in 0..20 {
        publisher.publish(job(&format!("j{i:02}"))).await.unwrap();
    }
    drop(publisher);

    let handler = ScriptedHandler::succeeding();
    let logger = Arc::new(RecordingLogger::new());
    let config = ConsumerConfig { concurrency: 4, ..ConsumerConfig::default() };
    let consumer = Consumer::new(Arc::new(source), handler.clone(), config).with_logger(logger.clone());

    consumer.start(&CancellationToken::new()).unwrap();
    consumer.join().await;

    let mut ids = handler.job_ids();
    ids.sort();
    let expected: Vec<String> = (0..20).map(|i| format!("j{i:02}")).collect();
    assert_eq!(ids, expected);
    assert_eq!(logger.count("job_handled"), 20);
    assert_eq!(logger.count("source_closed"), 4);
}

#[tokio::test]
async fn starting_twice_is_rejected() {
    let (_publisher, source) = in_memory(1);
    let consumer = Consumer::new(Arc::new(source), ScriptedHandler::succeeding(), ConsumerConfig::default());
    let cancel = CancellationToken::new();

    consumer.start(&cancel).unwrap();
    assert!(matches!(consumer.start(&cancel), Err(QueueError::AlreadyStarted)));
    consumer.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stop_returns_once_idle_workers_exit() {
    let (_publisher, source) = in_memory(1);
    let config = ConsumerConfig { concurrency: 3, ..ConsumerConfig::default() };
    let consumer = Consumer::new(Arc::new(source), ScriptedHandler::succeeding(), config);

    consumer.start(&CancellationToken::new()).unwrap();
    tokio::time::sleep(Duration::from_millis(350)).await;
    consumer.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stop_times_out_when_a_handler_ignores_cancellation() {
    let (publisher, source) = in_memory(1);
    publisher.publish(job("slow")).await.unwrap();

    let logger = Arc::new(RecordingLogger::new());
    let consumer = Consumer::new(Arc::new(source), Arc::new(StubbornHandler::default()), ConsumerConfig::default())
        .with_logger(logger.clone());

    consumer.start(&CancellationToken::new()).unwrap();
    wait_for(&logger, "job_dequeued", 1).await;

    let err = consumer.stop(Duration::from_millis(100)).await.unwrap_err();
    assert!(matches!(err, QueueError::StopTimeout(d) if d == Duration::from_millis(100)));
}

#[tokio::test(start_paused = true)]
async fn stopping_again_after_a_timeout_still_waits_for_the_handler() {
    let (publisher, source) = in_memory(1);
    publisher.publish(job("slow")).await.unwrap();

    let handler = Arc::new(StubbornHandler::default());
    let logger = Arc::new(RecordingLogger::new());
    let consumer = Consumer::new(Arc::new(source), handler.clone(), ConsumerConfig::default())
        .with_logger(logger.clone());

    consumer.start(&CancellationToken::new()).unwrap();
    wait_for(&logger, "job_dequeued", 1).await;

    assert!(matches!(consumer.stop(Duration::from_millis(100)).await, Err(QueueError::StopTimeout(_))));
    assert!(matches!(consumer.stop(Duration::from_millis(100)).await, Err(QueueError::StopTimeout(_))));
    assert!(!handler.finished.load(Ordering::SeqCst));

    consumer.join().await;
    assert!(handler.finished.load(Ordering::SeqCst));
    assert!(consumer.stop(Duration::from_millis(100)).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn zero_delay_retry_is_a_terminal_failure() {
    let (publisher, source) = in_memory(8);
    publisher.publish(job("j-1")).await.unwrap();
    drop(publisher);

    let handler = ScriptedHandler::always_failing();
    let logger = Arc::new(RecordingLogger::new());
    let consumer = Consumer::new(Arc::new(source), handler.clone(), ConsumerConfig::default())
        .with_retry(Arc::new(ZeroDelaySchedule))
        .with_logger(logger.clone());

    consumer.start(&CancellationToken::new()).unwrap();
    consumer.join().await;

    assert_eq!(handler.job_ids(), vec!["j-1"]);
    assert_eq!(logger.count("job_retry_scheduled"), 0);
    let terminal = logger.named("job_terminal_failure");
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].fields["reason"], json!("zero_delay"));
}

#[tokio::test(start_paused = true)]
async fn cancelling_the_parent_token_ends_the_pool() {
    let (_publisher, source) = in_memory(1);
    let consumer = Consumer::new(Arc::new(source), ScriptedHandler::succeeding(), ConsumerConfig::default());
    let cancel = CancellationToken::new();

    consumer.start(&cancel).unwrap();
    cancel.cancel();
    consumer.join().await;
}

// ============================================================================
// Workflow handler
// ============================================================================

fn workflow_handler(handlers: Vec<(&str, Arc<dyn StepHandler>)>) -> WorkflowJobHandler {
    let plan = JobPlan {
        job_type: "ingest".into(),
        source_id: "src-1".into(),
        steps: vec![
            PlanStep::new("fetch", "fetch"),
            PlanStep::new("store", "store").after(["fetch"]),
        ],
    };
    let catalog = PlanCatalog::from_plans([&plan]).unwrap();
    let registry: HandlerRegistry = handlers.into_iter().map(|(k, h)| (k.to_owned(), h)).collect();
    let executor = Executor::new(Arc::new(registry), ExecutorConfig::default())
        .with_logger(Arc::new(RecordingLogger::new()));
    WorkflowJobHandler::new(Arc::new(executor), Arc::new(catalog))
}

#[tokio::test(start_paused = true)]
async fn job_payload_is_visible_to_steps_as_vars() {
    let store = Arc::new(VarsCapture::default());
    let capture: Arc<dyn StepHandler> = store.clone();
    let handler = workflow_handler(vec![("fetch", Arc::new(MockHandler::setting("fetched"))), ("store", capture)]);

    let envelope = Envelope::new(job("wf-1").with_payload("cursor", "42"));
    handler.handle(&CancellationToken::new(), &envelope).await.unwrap();

    let seen = store.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0]["cursor"], "42");
    assert_eq!(seen[0]["fetch"], "fetched");
}

#[tokio::test(start_paused = true)]
async fn workflow_jobs_run_their_plan_end_to_end() {
    let fetch = Arc::new(MockHandler::setting("fetched"));
    let store = Arc::new(MockHandler::setting("stored"));
    let handler = workflow_handler(vec![("fetch", fetch.clone()), ("store", store.clone())]);

    let (publisher, source) = in_memory(8);
    publisher.publish(job("wf-1").with_payload("cursor", "42")).await.unwrap();
    drop(publisher);

    let logger = Arc::new(RecordingLogger::new());
    let consumer = Consumer::new(Arc::new(source), Arc::new(handler), ConsumerConfig::default())
        .with_logger(logger.clone());
    consumer.start(&CancellationToken::new()).unwrap();
    consumer.join().await;

    assert_eq!(fetch.seen(), vec!["fetch"]);
    assert_eq!(store.seen(), vec!["store"]);
    assert_eq!(logger.count("job_handled"), 1);
}

#[tokio::test]
async fn workflow_handler_reports_step_failures_and_unknown_types() {
    let handler = workflow_handler(vec![
        ("fetch", Arc::new(MockHandler::failing("upstream 503"))),
        ("store", Arc::new(MockHandler::setting("stored"))),
    ]);
    let cancel = CancellationToken::new();

    let err = handler.handle(&cancel, &Envelope::new(job("wf-1"))).await.unwrap_err();
    let msg = format!("{err:#}");
    assert!(msg.contains("workflow 'ingest' failed for job wf-1"), "{msg}");
    assert!(msg.contains("upstream 503"), "{msg}");

    let other = Job::new("wf-2", "tenant-a", "src-1", "export");
    let err = handler.handle(&cancel, &Envelope::new(other)).await.unwrap_err();
    assert!(err.to_string().contains("no plan registered for job type 'export'"));
}
