//! The `StepHandler` trait — the contract every workflow step must fulfil.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{ExecContext, Node, StepError};

/// The core step trait.
///
/// `cancel` fires when the step's time budget runs out or the whole run is
/// cancelled; long-running handlers should race their work against it.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Run the step and return the (possibly updated) execution context.
    async fn run(
        &self,
        cancel: CancellationToken,
        node: &Node,
        ctx: ExecContext,
    ) -> Result<ExecContext, StepError>;
}

/// Resolves handlers by `kind`.
pub trait Registry: Send + Sync {
    fn get(&self, kind: &str) -> Option<Arc<dyn StepHandler>>;
}

/// Maps `kind` strings to shared `StepHandler` implementations.
pub type HandlerRegistry = HashMap<String, Arc<dyn StepHandler>>;

impl Registry for HandlerRegistry {
    fn get(&self, kind: &str) -> Option<Arc<dyn StepHandler>> {
        HashMap::get(self, kind).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockHandler;

    #[test]
    fn registry_lookup_is_exact() {
        let mut registry = HandlerRegistry::new();
        registry.insert("ingest".into(), Arc::new(MockHandler::setting("x")));

        assert!(Registry::get(&registry, "ingest").is_some());
        assert!(Registry::get(&registry, "INGEST").is_none());
        assert!(Registry::get(&registry, "normalize").is_none());
    }
}
