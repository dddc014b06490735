//! `queue` crate — job envelopes and the pull-based worker pool that drains them.
//!
//! A [`Source`] hands out [`Envelope`]s; the [`Consumer`] runs a fixed number of
//! workers that pull from it, invoke a [`JobHandler`], and redeliver failed
//! jobs according to a [`RetrySchedule`].

pub mod error;
pub mod envelope;
pub mod source;
pub mod publisher;
pub mod consumer;
pub mod workflow;

pub use consumer::{Consumer, ConsumerConfig, JobHandler, Redelivery, RetrySchedule};
pub use envelope::{Envelope, Job, ENVELOPE_VERSION, JOB_ENVELOPE_TYPE};
pub use error::{QueueError, SourceError};
pub use publisher::{in_memory, InMemoryPublisher, Publisher};
pub use source::{ChannelSource, Source};
pub use workflow::WorkflowJobHandler;

#[cfg(test)]
mod consumer_tests;
