//! Dependency graph validation and ordering.

use crate::errors::GraphError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// A set of named nodes with "depends-on" edges.
///
/// Node order is significant: it is the tie-break order used by
/// [`order`](Self::order) and [`levels`](Self::levels). Edges declared for
/// ids outside the node set are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyGraph {
    nodes: Vec<String>,
    edges: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Creates a graph with the given nodes and no edges.
    #[must_use]
    pub fn new(nodes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            nodes: nodes.into_iter().map(Into::into).collect(),
            edges: HashMap::new(),
        }
    }

    /// Creates a graph from nodes and a dependency map.
    #[must_use]
    pub fn from_parts(nodes: Vec<String>, edges: HashMap<String, Vec<String>>) -> Self {
        Self { nodes, edges }
    }

    /// Declares that `node` depends on `dependency`.
    #[must_use]
    pub fn with_dependency(mut self, node: impl Into<String>, dependency: impl Into<String>) -> Self {
        self.add_dependency(node, dependency);
        self
    }

    /// Declares that `node` depends on `dependency`.
    pub fn add_dependency(&mut self, node: impl Into<String>, dependency: impl Into<String>) {
        let deps = self.edges.entry(node.into()).or_default();
        let dependency = dependency.into();
        if !deps.contains(&dependency) {
            deps.push(dependency);
        }
    }

    /// Returns the nodes in declaration order.
    #[must_use]
    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the direct dependencies of `node`.
    #[must_use]
    pub fn dependencies_of(&self, node: &str) -> &[String] {
        self.edges.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Returns the nodes that directly depend on `node`, in node order.
    #[must_use]
    pub fn dependents_of(&self, node: &str) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| self.dependencies_of(n).iter().any(|d| d == node))
            .cloned()
            .collect()
    }

    /// Checks that ids are unique, every dependency exists and there is no
    /// cycle, in that order.
    ///
    /// # Errors
    ///
    /// Returns the first [`GraphError`] found.
    pub fn validate(&self) -> Result<(), GraphError> {
        let mut seen = HashSet::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if !seen.insert(node.as_str()) {
                return Err(GraphError::DuplicateNode { node: node.clone() });
            }
        }

        for node in &self.nodes {
            for dep in self.dependencies_of(node) {
                if !seen.contains(dep.as_str()) {
                    return Err(GraphError::UnknownDependency {
                        node: node.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        self.traverse().map(|_| ())
    }

    /// Returns a topological order in which every node follows its
    /// dependencies.
    ///
    /// Nodes are visited in declaration order and each node's dependencies
    /// are placed immediately before it, so a graph without edges keeps its
    /// input order.
    ///
    /// # Errors
    ///
    /// Returns a [`GraphError`] if the graph is invalid.
    pub fn order(&self) -> Result<Vec<String>, GraphError> {
        self.validate()?;
        self.traverse()
    }

    /// Groups nodes into layers: every node's dependencies live in earlier
    /// layers. Nodes within a layer have no path between them and could run
    /// concurrently.
    ///
    /// # Errors
    ///
    /// Returns a [`GraphError`] if the graph is invalid.
    pub fn levels(&self) -> Result<Vec<Vec<String>>, GraphError> {
        let order = self.order()?;
        let mut depth: HashMap<&str, usize> = HashMap::with_capacity(order.len());
        for node in &order {
            let level = self
                .dependencies_of(node)
                .iter()
                .filter_map(|d| depth.get(d.as_str()))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(node.as_str(), level);
        }

        let layer_count = depth.values().max().map_or(0, |m| m + 1);
        let mut layers = vec![Vec::new(); layer_count];
        for node in &self.nodes {
            if let Some(&level) = depth.get(node.as_str()) {
                layers[level].push(node.clone());
            }
        }
        Ok(layers)
    }

    /// Restricts the graph to `keep`, dropping edges that leave the subset.
    #[must_use]
    pub fn subgraph(&self, keep: &HashSet<String>) -> Self {
        let nodes: Vec<String> = self.nodes.iter().filter(|n| keep.contains(*n)).cloned().collect();
        let edges = nodes
            .iter()
            .map(|n| {
                let deps = self
                    .dependencies_of(n)
                    .iter()
                    .filter(|d| keep.contains(*d))
                    .cloned()
                    .collect();
                (n.clone(), deps)
            })
            .collect();
        Self { nodes, edges }
    }

    /// Three-color depth-first traversal producing a post-order.
    fn traverse(&self) -> Result<Vec<String>, GraphError> {
        let mut colors: HashMap<&str, Color> =
            self.nodes.iter().map(|n| (n.as_str(), Color::White)).collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut path = Vec::new();

        for node in &self.nodes {
            if colors.get(node.as_str()) == Some(&Color::White) {
                self.visit(node, &mut colors, &mut path, &mut order)?;
            }
        }

        Ok(order)
    }

    fn visit<'a>(
        &'a self,
        node: &'a str,
        colors: &mut HashMap<&'a str, Color>,
        path: &mut Vec<&'a str>,
        order: &mut Vec<String>,
    ) -> Result<(), GraphError> {
        colors.insert(node, Color::Gray);
        path.push(node);

        for dep in self.dependencies_of(node) {
            match colors.get(dep.as_str()) {
                Some(Color::White) => self.visit(dep, colors, path, order)?,
                Some(Color::Gray) => {
                    let start = path.iter().position(|n| *n == dep.as_str()).unwrap_or(0);
                    let mut cycle: Vec<String> = path[start..].iter().map(|n| (*n).to_string()).collect();
                    cycle.push(dep.clone());
                    return Err(GraphError::Cycle { path: cycle });
                }
                // Finished nodes and unknown ids (rejected by `validate`) need no work.
                Some(Color::Black) | None => {}
            }
        }

        path.pop();
        colors.insert(node, Color::Black);
        order.push(node.to_string());
        Ok(())
    }
}

/// Validates a node set with its dependency map.
///
/// # Errors
///
/// Returns the first [`GraphError`] found.
pub fn validate(nodes: &[String], edges: &HashMap<String, Vec<String>>) -> Result<(), GraphError> {
    DependencyGraph::from_parts(nodes.to_vec(), edges.clone()).validate()
}

/// Returns a stable topological order of a node set.
///
/// # Errors
///
/// Returns a [`GraphError`] if the graph is invalid.
pub fn order(
    nodes: &[String],
    edges: &HashMap<String, Vec<String>>,
) -> Result<Vec<String>, GraphError> {
    DependencyGraph::from_parts(nodes.to_vec(), edges.clone()).order()
}
