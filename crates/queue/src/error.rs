//! Queue-level error types.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("envelope encode failed: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("envelope decode failed: {0}")]
    Decode(#[source] serde_json::Error),

    /// The envelope parsed but is not a job envelope we understand.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(&'static str),

    /// Every receiving end of the queue is gone.
    #[error("queue closed")]
    Closed,

    #[error("consumer already started")]
    AlreadyStarted,

    /// Workers were still busy when the stop deadline passed.
    #[error("consumer did not stop within {0:?}")]
    StopTimeout(Duration),
}

/// What a [`crate::Source`] reports instead of an envelope.
#[derive(Debug, Error)]
pub enum SourceError {
    /// No work right now; back off and ask again.
    #[error("source empty")]
    Empty,

    /// The source will never produce again.
    #[error("source closed")]
    Closed,

    /// The caller's cancellation token fired while waiting.
    #[error("source read cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
