//! Bridges the consumer to the workflow executor.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use engine::{Executor, PlanCatalog};
use nodes::ExecContext;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Envelope, JobHandler};

/// Runs the graph registered for a job's type, seeding `vars` from the payload.
pub struct WorkflowJobHandler {
    executor: Arc<Executor>,
    catalog: Arc<PlanCatalog>,
}

impl WorkflowJobHandler {
    pub fn new(executor: Arc<Executor>, catalog: Arc<PlanCatalog>) -> Self {
        Self { executor, catalog }
    }
}

#[async_trait]
impl JobHandler for WorkflowJobHandler {
    async fn handle(&self, cancel: &CancellationToken, envelope: &Envelope) -> anyhow::Result<()> {
        let job = &envelope.job;
        let graph = self
            .catalog
            .get(&job.job_type)
            .ok_or_else(|| anyhow!("no plan registered for job type '{}'", job.job_type))?;

        let mut ctx = ExecContext::new(&job.tenant_id, &job.job_id, &job.source_id, &job.job_type);
        ctx.vars = job.payload.clone();

        let done = self
            .executor
            .execute(cancel, &graph, ctx)
            .await
            .map_err(|failure| failure.error)
            .with_context(|| format!("workflow '{}' failed for job {}", job.job_type, job.job_id))?;

        debug!(job_id = %job.job_id, steps = done.trace.len() / 2, "workflow complete");
        Ok(())
    }
}
