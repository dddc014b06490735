//! Engine-level error types.

use std::time::Duration;

use nodes::{ExecContext, NodeId, StepError};
use thiserror::Error;

/// Errors produced while building or validating a graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// A node (or plan step) was given an empty ID.
    #[error("node invalid: empty node id")]
    EmptyNodeId,

    /// A node (or plan step) was given no kind.
    #[error("node invalid: node '{0}' has no kind")]
    MissingKind(NodeId),

    /// Two or more nodes share the same ID.
    #[error("node already exists: '{0}'")]
    DuplicateNodeId(NodeId),

    /// An edge was added with an empty `from` or `to`.
    #[error("edge invalid: empty endpoint")]
    EmptyEndpoint,

    /// An edge points from a node to itself.
    #[error("edge invalid: self edge on '{0}'")]
    SelfEdge(NodeId),

    /// An edge references a node ID that doesn't exist in the graph.
    #[error("node missing: '{node_id}' ({side} side)")]
    UnknownNodeReference {
        node_id: NodeId,
        side: &'static str,
    },

    /// A plan step listed a blank dependency.
    #[error("edge invalid: step '{step_id}' has an empty dependency")]
    EmptyDependency { step_id: NodeId },

    /// Topological sort could not consume every node.
    #[error("cycle detected")]
    CycleDetected,
}

/// Errors produced while compiling job plans into a catalog.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("plan has no job_type")]
    MissingJobType,

    #[error("plan for job type '{0}' registered twice")]
    DuplicateJobType(String),

    #[error("plan '{job_type}' failed to compile: {source}")]
    Compile {
        job_type: String,
        #[source]
        source: GraphError,
    },
}

/// Errors produced while executing a graph.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The graph failed validation before any step ran.
    #[error("dag invalid: {0}")]
    InvalidGraph(#[from] GraphError),

    /// No handler is registered for a node's kind.
    #[error("no handler for step kind '{kind}' (step '{step_id}')")]
    NoHandler { step_id: NodeId, kind: String },

    /// The step did not finish inside its time budget.
    #[error("step timeout: '{step_id}' exceeded {timeout:?}")]
    StepTimeout { step_id: NodeId, timeout: Duration },

    /// The step's handler returned an error.
    #[error("step '{step_id}' failed: {source}")]
    StepFailed {
        step_id: NodeId,
        #[source]
        source: StepError,
    },

    /// The caller's cancellation token fired.
    #[error("execution cancelled")]
    Cancelled,
}

impl ExecError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::StepTimeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// A failed run: the error plus the context (and partial trace) at the point
/// of failure.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct ExecutionFailure {
    #[source]
    pub error: ExecError,
    pub context: ExecContext,
}

impl ExecutionFailure {
    pub fn new(error: ExecError, context: ExecContext) -> Self {
        Self { error, context }
    }
}

/// A retry policy that failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("retry policy invalid: {0}")]
pub struct RetryPolicyError(pub &'static str);
