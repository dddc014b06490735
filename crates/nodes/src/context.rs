//! Data threaded through a workflow run.
//!
//! Defined here (in the nodes crate) so both the engine and individual handler
//! implementations can import them without a circular dependency.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a node, unique within one graph.
pub type NodeId = String;

/// A single step in a compiled graph. Immutable once added to a graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Selects the step handler at execution time.
    pub kind: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

impl Node {
    pub fn new(id: impl Into<NodeId>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Outcome recorded for one step transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Start,
    Ok,
    Error,
    Skip,
}

impl fmt::Display for TraceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Ok    => write!(f, "ok"),
            Self::Error => write!(f, "error"),
            Self::Skip  => write!(f, "skip"),
        }
    }
}

/// One append-only record of a step's execution within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub ts: DateTime<Utc>,
    pub step_id: NodeId,
    pub kind: String,
    pub status: TraceStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Mutable state owned by exactly one graph run.
///
/// Handlers may read and write `vars` to pass derived values forward. The
/// trace belongs to the executor: handlers receive a context with an empty
/// trace and whatever they put there is discarded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecContext {
    pub tenant_id: String,
    pub job_id: String,
    pub source_id: String,
    pub job_type: String,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    #[serde(default)]
    pub trace: Vec<TraceEvent>,
}

impl ExecContext {
    pub fn new(
        tenant_id: impl Into<String>,
        job_id: impl Into<String>,
        source_id: impl Into<String>,
        job_type: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            job_id: job_id.into(),
            source_id: source_id.into(),
            job_type: job_type.into(),
            ..Self::default()
        }
    }

    /// Trace events with the given status, in append order.
    pub fn events_with(&self, status: TraceStatus) -> impl Iterator<Item = &TraceEvent> {
        self.trace.iter().filter(move |ev| ev.status == status)
    }
}
