//! Publishing jobs onto a queue.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{ChannelSource, Envelope, Job, QueueError};

/// Puts jobs on a queue, wrapped in a job envelope.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, job: Job) -> Result<(), QueueError>;
}

/// Publishing half of a bounded in-memory queue.
///
/// `publish` waits for buffer space, so a full queue pushes back on the
/// producer instead of dropping work.
#[derive(Debug, Clone)]
pub struct InMemoryPublisher {
    tx: mpsc::Sender<Envelope>,
}

/// Create a bounded in-memory queue holding up to `buffer` envelopes.
pub fn in_memory(buffer: usize) -> (InMemoryPublisher, ChannelSource) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (InMemoryPublisher { tx }, ChannelSource::new(rx))
}

impl InMemoryPublisher {
    /// Forward an already-built envelope untouched.
    pub async fn publish_envelope(&self, env: Envelope) -> Result<(), QueueError> {
        self.tx.send(env).await.map_err(|_| QueueError::Closed)
    }
}

#[async_trait]
impl Publisher for InMemoryPublisher {
    async fn publish(&self, job: Job) -> Result<(), QueueError> {
        let env = Envelope::new(job);
        // Encode anyway so the envelope is known to survive the wire.
        env.encode()?;
        debug!(job_id = %env.job.job_id, attempt = env.job.attempt, "publishing job");
        self.publish_envelope(env).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Source, SourceError};
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn published_jobs_arrive_wrapped_in_order() {
        let (publisher, source) = in_memory(8);
        publisher.publish(Job::new("a", "t", "s", "ingest")).await.unwrap();
        publisher.publish(Job::new("b", "t", "s", "ingest")).await.unwrap();
        drop(publisher);

        let cancel = CancellationToken::new();
        let first = source.next(&cancel).await.unwrap();
        assert_eq!(first.job.job_id, "a");
        assert_eq!(first.kind, "job");
        assert_eq!(source.next(&cancel).await.unwrap().job.job_id, "b");
        assert!(matches!(source.next(&cancel).await, Err(SourceError::Closed)));
    }

    #[tokio::test]
    async fn publish_fails_once_the_source_is_gone() {
        let (publisher, source) = in_memory(1);
        drop(source);
        let err = publisher.publish(Job::new("a", "t", "s", "ingest")).await.unwrap_err();
        assert!(matches!(err, QueueError::Closed));
    }
}
