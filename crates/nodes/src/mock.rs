//! `MockHandler` — a test double for `StepHandler`.
//!
//! Useful in unit and integration tests where a real step implementation is
//! either unavailable or irrelevant.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{ExecContext, Node, StepError, StepHandler};

/// Behaviour injected into `MockHandler` at construction time.
pub enum MockBehaviour {
    /// Succeed, recording `"<node id>" => value` in the context vars.
    SetVar(String),
    /// Fail every call with the given message.
    Fail(String),
    /// Fail the first `n` calls, then behave like `SetVar`.
    FailTimes(usize, String),
    /// Wait for the given duration (or cancellation) before succeeding.
    Sleep(Duration),
}

/// A mock handler that records every node it is asked to run and returns a
/// programmer-specified result.
pub struct MockHandler {
    pub behaviour: MockBehaviour,
    /// IDs of all nodes seen by this handler (in call order).
    pub calls: Arc<Mutex<Vec<String>>>,
    failures: AtomicUsize,
}

impl MockHandler {
    fn with(behaviour: MockBehaviour) -> Self {
        Self {
            behaviour,
            calls: Arc::new(Mutex::new(Vec::new())),
            failures: AtomicUsize::new(0),
        }
    }

    /// Create a mock that always succeeds and records `value` under the node ID.
    pub fn setting(value: impl Into<String>) -> Self {
        Self::with(MockBehaviour::SetVar(value.into()))
    }

    /// Create a mock that always fails.
    pub fn failing(msg: impl Into<String>) -> Self {
        Self::with(MockBehaviour::Fail(msg.into()))
    }

    /// Create a mock that fails `times` times before succeeding.
    pub fn flaky(times: usize, value: impl Into<String>) -> Self {
        Self::with(MockBehaviour::FailTimes(times, value.into()))
    }

    /// Create a mock that sleeps for `delay` unless cancelled first.
    pub fn sleeping(delay: Duration) -> Self {
        Self::with(MockBehaviour::Sleep(delay))
    }

    /// Number of times this handler has been run.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Node IDs in the order they were run.
    pub fn seen(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl StepHandler for MockHandler {
    async fn run(
        &self,
        cancel: CancellationToken,
        node: &Node,
        mut ctx: ExecContext,
    ) -> Result<ExecContext, StepError> {
        self.calls.lock().unwrap().push(node.id.clone());
        debug!(step_id = %node.id, kind = %node.kind, "mock handler invoked");

        match &self.behaviour {
            MockBehaviour::SetVar(value) => {
                ctx.vars.insert(node.id.clone(), value.clone());
                Ok(ctx)
            }
            MockBehaviour::Fail(msg) => Err(StepError::failed(msg.clone())),
            MockBehaviour::FailTimes(times, value) => {
                if self.failures.fetch_add(1, Ordering::SeqCst) < *times {
                    return Err(StepError::failed(format!("{} flaked", node.id)));
                }
                ctx.vars.insert(node.id.clone(), value.clone());
                Ok(ctx)
            }
            MockBehaviour::Sleep(delay) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(StepError::Cancelled),
                    _ = tokio::time::sleep(*delay) => Ok(ctx),
                }
            }
        }
    }
}
