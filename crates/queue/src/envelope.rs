//! Wire types exchanged at the queue boundary.
//!
//! ```json
//! {"version": "v1", "type": "job", "sent_at": "2024-01-01T00:00:00Z",
//!  "job": {"job_id": "...", "tenant_id": "...", "source_id": "...",
//!          "job_type": "ingest", "requested_at": "...", "attempt": 0,
//!          "payload": {"k": "v"}}}
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::QueueError;

pub const ENVELOPE_VERSION: &str = "v1";
pub const JOB_ENVELOPE_TYPE: &str = "job";

/// A triggered job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub tenant_id: String,
    pub source_id: String,
    pub job_type: String,
    pub requested_at: DateTime<Utc>,
    /// Delivery attempt; `0` for the first delivery.
    #[serde(default)]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub payload: BTreeMap<String, String>,
}

impl Job {
    pub fn new(
        job_id: impl Into<String>,
        tenant_id: impl Into<String>,
        source_id: impl Into<String>,
        job_type: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            tenant_id: tenant_id.into(),
            source_id: source_id.into(),
            job_type: job_type.into(),
            requested_at: Utc::now(),
            attempt: 0,
            payload: BTreeMap::new(),
        }
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }
}

/// Versioned transport wrapper around a [`Job`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope {
    pub version: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub sent_at: DateTime<Utc>,
    pub job: Job,
}

impl Envelope {
    /// Wrap a job in a `v1` job envelope stamped with the current time.
    pub fn new(job: Job) -> Self {
        Self {
            version: ENVELOPE_VERSION.to_owned(),
            kind: JOB_ENVELOPE_TYPE.to_owned(),
            sent_at: Utc::now(),
            job,
        }
    }

    /// Structural check applied by consumers before handling.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.kind != JOB_ENVELOPE_TYPE {
            return Err(QueueError::InvalidEnvelope("type is not \"job\""));
        }
        if self.version.trim().is_empty() {
            return Err(QueueError::InvalidEnvelope("missing version"));
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, QueueError> {
        serde_json::to_vec(self).map_err(QueueError::Encode)
    }

    /// Parse an envelope, rejecting unknown top-level fields.
    pub fn decode(bytes: &[u8]) -> Result<Self, QueueError> {
        serde_json::from_slice(bytes).map_err(QueueError::Decode)
    }
}
