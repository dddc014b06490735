//! Job plans — the user-authored step lists compiled into graphs.
//!
//! These types are the source of truth for what a job looks like before
//! compilation. They deserialize straight from the JSON a host loads from its
//! config store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use nodes::Node;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Graph, GraphError, PlanError};

/// A single step of a plan; `after` names the steps it waits for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

impl PlanStep {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            ..Self::default()
        }
    }

    pub fn after<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.after.extend(deps.into_iter().map(Into::into));
        self
    }
}

/// A complete job plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPlan {
    pub job_type: String,
    #[serde(default)]
    pub source_id: String,
    pub steps: Vec<PlanStep>,
}

/// Compile a plan into a validated graph.
///
/// Step IDs, kinds, and dependency names are trimmed. Nothing is returned
/// unless the whole graph validates; the plan itself is never modified.
///
/// # Errors
/// Any [`GraphError`]: blank fields, duplicate step IDs, blank or unknown
/// dependencies, or a cycle.
pub fn build_from_plan(plan: &JobPlan) -> Result<Graph, GraphError> {
    let mut graph = Graph::new();

    for step in &plan.steps {
        let id = step.id.trim();
        if id.is_empty() {
            return Err(GraphError::EmptyNodeId);
        }
        let kind = step.kind.trim();
        if kind.is_empty() {
            return Err(GraphError::MissingKind(id.to_owned()));
        }
        graph.add_node(Node {
            id: id.to_owned(),
            kind: kind.to_owned(),
            params: step.params.clone(),
        })?;
    }

    for step in &plan.steps {
        let to = step.id.trim();
        for dep in &step.after {
            let from = dep.trim();
            if from.is_empty() {
                return Err(GraphError::EmptyDependency {
                    step_id: to.to_owned(),
                });
            }
            graph.add_edge(from, to)?;
        }
    }

    graph.validate()?;
    Ok(graph)
}

/// Compiled graphs keyed by job type (case-insensitive).
///
/// Plans are compiled once when registered so construction errors surface at
/// load time; executions share the resulting `Arc<Graph>`.
#[derive(Debug, Clone, Default)]
pub struct PlanCatalog {
    graphs: HashMap<String, Arc<Graph>>,
}

impl PlanCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile every plan, failing on the first that doesn't compile.
    pub fn from_plans<'a>(plans: impl IntoIterator<Item = &'a JobPlan>) -> Result<Self, PlanError> {
        let mut catalog = Self::new();
        for plan in plans {
            catalog.insert(plan)?;
        }
        Ok(catalog)
    }

    /// Compile and register one plan.
    pub fn insert(&mut self, plan: &JobPlan) -> Result<Arc<Graph>, PlanError> {
        let key = catalog_key(&plan.job_type);
        if key.is_empty() {
            return Err(PlanError::MissingJobType);
        }
        if self.graphs.contains_key(&key) {
            return Err(PlanError::DuplicateJobType(key));
        }

        let graph = build_from_plan(plan).map_err(|source| PlanError::Compile {
            job_type: key.clone(),
            source,
        })?;
        debug!(job_type = %key, steps = graph.len(), "plan compiled");

        let graph = Arc::new(graph);
        self.graphs.insert(key, Arc::clone(&graph));
        Ok(graph)
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<Graph>> {
        self.graphs.get(&catalog_key(job_type)).cloned()
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.graphs.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

fn catalog_key(job_type: &str) -> String {
    job_type.trim().to_lowercase()
}
