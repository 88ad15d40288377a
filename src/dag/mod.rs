//! Dependency graph construction and topological layering.
//!
//! The graph is built from the workflow's target-side link index; every node
//! appears as a vertex, dependency-free ones included. Layering is Kahn's
//! algorithm: each round emits the vertices with zero remaining in-degree,
//! so all members of a layer are mutually independent and every link points
//! from an earlier layer to a later one. A round that emits nothing while
//! vertices remain means a cycle.
//!
//! Vertices are kept in node insertion order, which makes layer contents and
//! execution traces deterministic.

use crate::error::{FlowError, FlowResult};
use crate::workflow::Workflow;
use indexmap::{IndexMap, IndexSet};

/// Adjacency view of a workflow's links
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// node -> the nodes it depends on
    dependencies: IndexMap<String, IndexSet<String>>,
    /// node -> the nodes that depend on it
    dependents: IndexMap<String, IndexSet<String>>,
}

impl DependencyGraph {
    /// Create a graph with the given vertices and no edges
    pub fn new<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut graph = Self::default();
        for node in nodes {
            let name = node.into();
            graph.dependencies.entry(name.clone()).or_default();
            graph.dependents.entry(name).or_default();
        }
        graph
    }

    /// Build the graph from a workflow's nodes and its target-side link index
    pub fn from_workflow(workflow: &Workflow) -> Self {
        let mut graph = Self::new(workflow.node_names());
        for (target, links) in workflow.links_by_target() {
            for link in links {
                graph.add_dependency(target, &link.source_node);
            }
        }
        graph
    }

    /// Record that `node` depends on `depends_on`
    pub fn add_dependency(&mut self, node: &str, depends_on: &str) {
        self.dependencies
            .entry(node.to_string())
            .or_default()
            .insert(depends_on.to_string());
        self.dependents
            .entry(depends_on.to_string())
            .or_default()
            .insert(node.to_string());
        self.dependencies.entry(depends_on.to_string()).or_default();
        self.dependents.entry(node.to_string()).or_default();
    }

    /// The nodes `node` depends on
    pub fn dependencies_of(&self, node: &str) -> Option<&IndexSet<String>> {
        self.dependencies.get(node)
    }

    /// The nodes depending on `node`
    pub fn dependents_of(&self, node: &str) -> Option<&IndexSet<String>> {
        self.dependents.get(node)
    }

    /// Number of vertices
    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    /// Whether the graph has no vertices
    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    /// Topologically layer the graph.
    ///
    /// Fails with [`FlowError::Cycle`] naming one unschedulable node if a
    /// round emits nothing while vertices remain.
    pub fn layers(&self) -> FlowResult<Vec<Vec<String>>> {
        let mut remaining: IndexMap<&str, usize> = self
            .dependencies
            .iter()
            .map(|(node, deps)| (node.as_str(), deps.len()))
            .collect();

        let mut layers = Vec::new();
        while !remaining.is_empty() {
            let layer: Vec<String> = remaining
                .iter()
                .filter(|(_, &degree)| degree == 0)
                .map(|(&node, _)| node.to_string())
                .collect();

            if layer.is_empty() {
                // Every remaining vertex still has unmet dependencies.
                let node = remaining
                    .keys()
                    .next()
                    .map(|n| n.to_string())
                    .unwrap_or_default();
                return Err(FlowError::Cycle { node });
            }

            for node in &layer {
                remaining.shift_remove(node.as_str());
                if let Some(successors) = self.dependents.get(node.as_str()) {
                    for successor in successors {
                        if let Some(degree) = remaining.get_mut(successor.as_str()) {
                            *degree -= 1;
                        }
                    }
                }
            }

            layers.push(layer);
        }

        Ok(layers)
    }

    /// Split a layer slice into nodes safe to dispatch concurrently and a
    /// residual remainder.
    ///
    /// Kahn layering guarantees no member depends on another, so the residual
    /// is normally empty; a member lands there only if one of its direct
    /// dependencies is sitting in the same slice (possible when the caller
    /// re-slices layers after a partial recovery).
    pub fn partition_independent(&self, layer: &[String]) -> (Vec<String>, Vec<String>) {
        let members: IndexSet<&str> = layer.iter().map(String::as_str).collect();
        let mut independent = Vec::new();
        let mut residual = Vec::new();

        for node in layer {
            let depends_on_member = self
                .dependencies
                .get(node.as_str())
                .map(|deps| deps.iter().any(|d| members.contains(d.as_str())))
                .unwrap_or(false);
            if depends_on_member {
                residual.push(node.clone());
            } else {
                independent.push(node.clone());
            }
        }

        (independent, residual)
    }
}
