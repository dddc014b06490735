//! Step-level error type.

use thiserror::Error;

/// Errors returned by a handler's `run` method.
///
/// The executor records the message in the trace and, in hard-fail mode,
/// aborts the run. Retrying is left to whoever redelivers the whole job.
#[derive(Debug, Error)]
pub enum StepError {
    /// The step ran and reported a failure.
    #[error("{0}")]
    Failed(String),

    /// The step observed its cancellation token and gave up.
    #[error("step cancelled")]
    Cancelled,

    /// Any other failure bubbled up from the handler's collaborators.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StepError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}
