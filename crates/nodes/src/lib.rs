//! `nodes` crate — the step-handler contract every workflow step implements.
//!
//! The engine resolves a [`StepHandler`] for each graph node through a
//! [`Registry`] keyed by the node's `kind` string. Handlers are supplied by the
//! host application (ingestion, normalization, storage writes, ...).

pub mod context;
pub mod error;
pub mod traits;
pub mod mock;

pub use context::{ExecContext, Node, NodeId, TraceEvent, TraceStatus};
pub use error::StepError;
pub use traits::{HandlerRegistry, Registry, StepHandler};
