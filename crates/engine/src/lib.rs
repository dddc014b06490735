//! `engine` crate — graph model, plan compilation, execution, and retry policy.

pub mod error;
pub mod dag;
pub mod plan;
pub mod executor;
pub mod retry;
pub mod logging;

pub use dag::{Edge, Graph};
pub use error::{ExecError, ExecutionFailure, GraphError, PlanError, RetryPolicyError};
pub use executor::{Executor, ExecutorConfig, FailureMode};
pub use logging::{EventLogger, LogFields, LogLevel, RecordingLogger, TracingLogger};
pub use plan::{build_from_plan, JobPlan, PlanCatalog, PlanStep};
pub use retry::{GiveUpReason, RetryDecision, RetryPolicy};
