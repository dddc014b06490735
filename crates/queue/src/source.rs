//! Pull-based envelope sources.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio_util::sync::CancellationToken;

use crate::{Envelope, SourceError};

/// Where workers get their next envelope from.
///
/// [`SourceError::Empty`] is a backpressure signal, not a failure: the worker
/// backs off and asks again. [`SourceError::Closed`] is terminal.
#[async_trait]
pub trait Source: Send + Sync {
    async fn next(&self, cancel: &CancellationToken) -> Result<Envelope, SourceError>;
}

/// Adapts an in-memory envelope channel to [`Source`].
///
/// Never blocks: an empty channel reports `Empty` immediately, and the source
/// reports `Closed` once every sender is dropped and the buffer is drained.
pub struct ChannelSource {
    rx: Mutex<mpsc::Receiver<Envelope>>,
}

impl ChannelSource {
    pub fn new(rx: mpsc::Receiver<Envelope>) -> Self {
        Self { rx: Mutex::new(rx) }
    }
}

#[async_trait]
impl Source for ChannelSource {
    async fn next(&self, cancel: &CancellationToken) -> Result<Envelope, SourceError> {
        if cancel.is_cancelled() {
            return Err(SourceError::Cancelled);
        }
        let mut rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
        match rx.try_recv() {
            Ok(env) => Ok(env),
            Err(TryRecvError::Empty) => Err(SourceError::Empty),
            Err(TryRecvError::Disconnected) => Err(SourceError::Closed),
        }
    }
}
