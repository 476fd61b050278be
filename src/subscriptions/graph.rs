//! Dependency edges between subscriptions.

use crate::error::{Result, SyncError};
use crate::types::NodeId;
use std::collections::{BTreeMap, BTreeSet};

/// Directed acyclic graph of "depends on" edges.
///
/// Acyclicity is checked when edges are added; traversal never has to guard
/// against cycles.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// node -> nodes it depends on
    dependencies: BTreeMap<NodeId, BTreeSet<NodeId>>,
    /// node -> nodes that depend on it
    dependents: BTreeMap<NodeId, BTreeSet<NodeId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `node` depends on every node in `on`.
    ///
    /// All edges are checked before any is inserted.
    pub fn add_dependencies(&mut self, node: NodeId, on: &[NodeId]) -> Result<()> {
        for dep in on {
            if *dep == node || self.reaches(*dep, node) {
                return Err(SyncError::DependencyCycle {
                    from: node.0,
                    to: dep.0,
                });
            }
        }
        self.dependencies.entry(node).or_default();
        for dep in on {
            self.dependencies.entry(node).or_default().insert(*dep);
            self.dependents.entry(*dep).or_default().insert(node);
        }
        Ok(())
    }

    /// Record a single edge.
    pub fn add_dependency(&mut self, node: NodeId, on: NodeId) -> Result<()> {
        self.add_dependencies(node, &[on])
    }

    /// Remove a node and every edge touching it.
    pub fn remove_node(&mut self, node: NodeId) {
        if let Some(deps) = self.dependencies.remove(&node) {
            for dep in deps {
                if let Some(set) = self.dependents.get_mut(&dep) {
                    set.remove(&node);
                    if set.is_empty() {
                        self.dependents.remove(&dep);
                    }
                }
            }
        }
        if let Some(users) = self.dependents.remove(&node) {
            for user in users {
                if let Some(set) = self.dependencies.get_mut(&user) {
                    set.remove(&node);
                }
            }
        }
    }

    pub fn dependencies_of(&self, node: NodeId) -> Vec<NodeId> {
        self.dependencies
            .get(&node)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn dependents_of(&self, node: NodeId) -> Vec<NodeId> {
        self.dependents
            .get(&node)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.dependencies.contains_key(&node) || self.dependents.contains_key(&node)
    }

    /// Whether `to` is reachable from `from` by following dependencies.
    pub fn reaches(&self, from: NodeId, to: NodeId) -> bool {
        let mut stack = vec![from];
        let mut seen = BTreeSet::new();
        while let Some(node) = stack.pop() {
            if node == to {
                return true;
            }
            if !seen.insert(node) {
                continue;
            }
            if let Some(deps) = self.dependencies.get(&node) {
                stack.extend(deps.iter().copied());
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edges_both_ways() {
        let mut graph = DependencyGraph::new();
        graph.add_dependencies(NodeId(3), &[NodeId(1), NodeId(2)]).unwrap();
        assert_eq!(graph.dependencies_of(NodeId(3)), vec![NodeId(1), NodeId(2)]);
        assert_eq!(graph.dependents_of(NodeId(1)), vec![NodeId(3)]);
        assert!(graph.reaches(NodeId(3), NodeId(2)));
        assert!(!graph.reaches(NodeId(2), NodeId(3)));
    }

    #[test]
    fn test_rejects_self_edge() {
        let mut graph = DependencyGraph::new();
        let result = graph.add_dependency(NodeId(1), NodeId(1));
        assert!(matches!(result, Err(SyncError::DependencyCycle { .. })));
    }

    #[test]
    fn test_rejects_transitive_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(NodeId(2), NodeId(1)).unwrap();
        graph.add_dependency(NodeId(3), NodeId(2)).unwrap();

        let result = graph.add_dependencies(NodeId(1), &[NodeId(4), NodeId(3)]);
        assert_eq!(
            result,
            Err(SyncError::DependencyCycle { from: 1, to: 3 })
        );
        // Nothing partial was inserted.
        assert!(graph.dependencies_of(NodeId(1)).is_empty());
        assert!(graph.dependents_of(NodeId(4)).is_empty());
    }

    #[test]
    fn test_remove_node() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(NodeId(2), NodeId(1)).unwrap();
        graph.add_dependency(NodeId(3), NodeId(2)).unwrap();

        graph.remove_node(NodeId(2));
        assert!(!graph.contains(NodeId(2)));
        assert!(graph.dependents_of(NodeId(1)).is_empty());
        assert!(graph.dependencies_of(NodeId(3)).is_empty());
        assert!(!graph.reaches(NodeId(3), NodeId(1)));
    }
}
