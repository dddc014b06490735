//! The graph model — nodes, edges, and deterministic topological ordering.
//!
//! Rules enforced:
//! 1. Node IDs must be non-empty and unique; every node needs a kind.
//! 2. Every edge must reference existing nodes and may not be a self edge.
//! 3. The directed graph must be acyclic (topological sort must succeed).
//!
//! Ties in the topological order are broken lexicographically by node ID, so
//! two graphs with the same nodes and edges always yield the same order no
//! matter how they were inserted.

use std::collections::{BTreeSet, HashMap};

use nodes::{Node, NodeId};
use serde::Serialize;

use crate::GraphError;

/// Directed edge: `from` must complete before `to` starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
}

/// A static dependency graph of job steps.
///
/// Built once per plan compilation and read-only afterwards, so it can be
/// shared across concurrent executions behind an `Arc`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Graph {
    nodes: HashMap<NodeId, Node>,
    edges: Vec<Edge>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add a node.
    ///
    /// # Errors
    /// - [`GraphError::EmptyNodeId`] / [`GraphError::MissingKind`] for blank fields.
    /// - [`GraphError::DuplicateNodeId`] if the ID is already present.
    pub fn add_node(&mut self, node: Node) -> Result<(), GraphError> {
        if node.id.trim().is_empty() {
            return Err(GraphError::EmptyNodeId);
        }
        if node.kind.trim().is_empty() {
            return Err(GraphError::MissingKind(node.id));
        }
        if self.nodes.contains_key(&node.id) {
            return Err(GraphError::DuplicateNodeId(node.id));
        }
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Add an edge `from -> to` between two existing nodes.
    pub fn add_edge(
        &mut self,
        from: impl Into<NodeId>,
        to: impl Into<NodeId>,
    ) -> Result<(), GraphError> {
        let edge = Edge {
            from: from.into(),
            to: to.into(),
        };
        self.check_edge(&edge)?;
        self.edges.push(edge);
        Ok(())
    }

    fn check_edge(&self, edge: &Edge) -> Result<(), GraphError> {
        if edge.from.is_empty() || edge.to.is_empty() {
            return Err(GraphError::EmptyEndpoint);
        }
        if edge.from == edge.to {
            return Err(GraphError::SelfEdge(edge.from.clone()));
        }
        if !self.nodes.contains_key(&edge.from) {
            return Err(GraphError::UnknownNodeReference {
                node_id: edge.from.clone(),
                side: "from",
            });
        }
        if !self.nodes.contains_key(&edge.to) {
            return Err(GraphError::UnknownNodeReference {
                node_id: edge.to.clone(),
                side: "to",
            });
        }
        Ok(())
    }

    /// Re-check every edge and make sure the graph is acyclic.
    pub fn validate(&self) -> Result<(), GraphError> {
        self.validated_order().map(drop)
    }

    /// [`Graph::validate`] and [`Graph::topo_sort`] in one pass.
    pub fn validated_order(&self) -> Result<Vec<NodeId>, GraphError> {
        for edge in &self.edges {
            self.check_edge(edge)?;
        }
        self.topo_sort()
    }

    /// Deterministic topological order (Kahn's algorithm).
    ///
    /// When several nodes are ready at once the lexicographically smallest ID
    /// goes first.
    ///
    /// # Errors
    /// [`GraphError::CycleDetected`] if the graph is not acyclic; no partial
    /// order is returned.
    pub fn topo_sort(&self) -> Result<Vec<NodeId>, GraphError> {
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::with_capacity(self.nodes.len());
        let mut in_degree: HashMap<&str, usize> = HashMap::with_capacity(self.nodes.len());

        for id in self.nodes.keys() {
            adjacency.entry(id.as_str()).or_default();
            in_degree.entry(id.as_str()).or_insert(0);
        }

        for edge in &self.edges {
            let Some(deg) = in_degree.get_mut(edge.to.as_str()) else {
                return Err(GraphError::UnknownNodeReference {
                    node_id: edge.to.clone(),
                    side: "to",
                });
            };
            *deg += 1;
            adjacency
                .entry(edge.from.as_str())
                .or_default()
                .push(edge.to.as_str());
        }

        // Ready set, kept ordered so the smallest ID is always taken first.
        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&id, _)| id)
            .collect();

        let mut sorted: Vec<NodeId> = Vec::with_capacity(self.nodes.len());

        while let Some(node_id) = ready.pop_first() {
            sorted.push(node_id.to_owned());

            if let Some(neighbours) = adjacency.get(node_id) {
                for &neighbour in neighbours {
                    if let Some(deg) = in_degree.get_mut(neighbour) {
                        *deg -= 1;
                        if *deg == 0 {
                            ready.insert(neighbour);
                        }
                    }
                }
            }
        }

        // If we didn't visit every node the graph contains a cycle.
        if sorted.len() != self.nodes.len() {
            return Err(GraphError::CycleDetected);
        }

        Ok(sorted)
    }

    pub fn reverse_topo_sort(&self) -> Result<Vec<NodeId>, GraphError> {
        let mut order = self.topo_sort()?;
        order.reverse();
        Ok(order)
    }

    /// Nodes that directly depend on `id`, sorted and de-duplicated.
    pub fn dependents(&self, id: &str) -> Vec<NodeId> {
        self.edges
            .iter()
            .filter(|e| e.from == id)
            .map(|e| e.to.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Nodes that `id` directly depends on, sorted and de-duplicated.
    pub fn dependencies(&self, id: &str) -> Vec<NodeId> {
        self.edges
            .iter()
            .filter(|e| e.to == id)
            .map(|e| e.from.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}
