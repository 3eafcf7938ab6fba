//! The dependency graph of component nodes.
//!
//! Edges are derived, not declared: after a block's attributes are parsed
//! into expressions, the loader computes the referenced node IDs and installs
//! them as the node's dependency set. An edge `A → B` means A's arguments
//! reference B's exports; propagation travels the opposite direction.

use std::collections::BinaryHeap;
use std::sync::Arc;

use fxhash::{FxHashMap, FxHashSet};
use thiserror::Error;

use super::node::ComponentNode;

/// Unique identifier of a node: `<component_type>.<label>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

/// A directed edge: `from` references `to`'s exports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
}

/// A cycle of component references.
#[derive(Debug, Clone, Error)]
#[error("cycle detected: {}", format_cycle(.cycle))]
pub struct CycleError {
    /// A representative cycle, each node referencing the next.
    pub cycle: Vec<NodeId>,
}

fn format_cycle(cycle: &[NodeId]) -> String {
    let mut ids: Vec<&str> = cycle.iter().map(NodeId::as_str).collect();
    if let Some(first) = ids.first().copied() {
        ids.push(first);
    }
    ids.join(" -> ")
}

/// Mutable DAG of component nodes keyed by [`NodeId`].
///
/// Acyclicity is not enforced on mutation; [`Graph::topological_sort`]
/// reports a cycle if one was introduced, and the loader rejects such a
/// configuration before committing it.
pub(crate) struct Graph {
    nodes: FxHashMap<NodeId, Arc<ComponentNode>>,
    /// Node IDs in insertion order. Topological sort breaks ties with it.
    order: Vec<NodeId>,
    /// `dependencies[a]` holds the IDs `a` references (outgoing edges).
    dependencies: FxHashMap<NodeId, Vec<NodeId>>,
    /// `dependents[b]` holds the IDs that reference `b` (incoming edges).
    dependents: FxHashMap<NodeId, Vec<NodeId>>,
}

impl Graph {
    pub fn new() -> Self {
        Self {
            nodes: FxHashMap::default(),
            order: Vec::new(),
            dependencies: FxHashMap::default(),
            dependents: FxHashMap::default(),
        }
    }

    /// Adds a node. Returns false (and leaves the graph untouched) if a node
    /// with the same ID is already present.
    pub fn add_node(&mut self, node: Arc<ComponentNode>) -> bool {
        let id = node.id().clone();
        if self.nodes.contains_key(&id) {
            return false;
        }
        self.order.push(id.clone());
        self.dependencies.insert(id.clone(), Vec::new());
        self.dependents.insert(id.clone(), Vec::new());
        self.nodes.insert(id, node);
        true
    }

    /// Removes a node and every edge touching it.
    pub fn remove_node(&mut self, id: &NodeId) -> Option<Arc<ComponentNode>> {
        let node = self.nodes.remove(id)?;
        self.order.retain(|n| n != id);
        for dep in self.dependencies.remove(id).unwrap_or_default() {
            if let Some(back) = self.dependents.get_mut(&dep) {
                back.retain(|n| n != id);
            }
        }
        for dependent in self.dependents.remove(id).unwrap_or_default() {
            if let Some(fwd) = self.dependencies.get_mut(&dependent) {
                fwd.retain(|n| n != id);
            }
        }
        Some(node)
    }

    pub fn get(&self, id: &NodeId) -> Option<&Arc<ComponentNode>> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// All nodes, in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &Arc<ComponentNode>> {
        self.order.iter().map(|id| &self.nodes[id])
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.order.iter()
    }

    /// Every edge of the graph, grouped by source node in insertion order.
    pub fn edges(&self) -> Vec<Edge> {
        let mut edges = Vec::new();
        for from in &self.order {
            for to in &self.dependencies[from] {
                edges.push(Edge {
                    from: from.clone(),
                    to: to.clone(),
                });
            }
        }
        edges
    }

    /// Replaces the dependency set of `from` with `to`.
    ///
    /// Every target must already be present in the graph; on a missing target
    /// the edges are left unchanged and the offending ID is returned.
    pub fn set_dependencies(&mut self, from: &NodeId, to: Vec<NodeId>) -> Result<(), NodeId> {
        debug_assert!(self.nodes.contains_key(from));
        if let Some(missing) = to.iter().find(|id| !self.nodes.contains_key(id)) {
            return Err(missing.clone());
        }
        for old in self.dependencies.get(from).cloned().unwrap_or_default() {
            if let Some(back) = self.dependents.get_mut(&old) {
                back.retain(|n| n != from);
            }
        }
        for target in &to {
            self.dependents.get_mut(target).unwrap().push(from.clone());
        }
        self.dependencies.insert(from.clone(), to);
        Ok(())
    }

    pub fn dependencies_of(&self, id: &NodeId) -> &[NodeId] {
        self.dependencies.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn dependents_of(&self, id: &NodeId) -> &[NodeId] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Nodes that reference no other node.
    pub fn leaves(&self) -> Vec<&Arc<ComponentNode>> {
        self.order
            .iter()
            .filter(|id| self.dependencies[*id].is_empty())
            .map(|id| &self.nodes[id])
            .collect()
    }

    /// Orders the nodes so that every dependency precedes its dependents.
    ///
    /// Ties are broken by insertion order, making the result stable across
    /// identical applies.
    pub fn topological_sort(&self) -> Result<Vec<Arc<ComponentNode>>, CycleError> {
        let sorted = self.sort_subset(self.order.iter())?;
        Ok(sorted)
    }

    /// Nodes transitively depending on `from` (excluding `from` itself), in
    /// propagation order: every dependency precedes its dependents.
    pub fn reachable(&self, from: &NodeId) -> Vec<Arc<ComponentNode>> {
        let mut set = FxHashSet::default();
        let mut stack: Vec<NodeId> = self.dependents_of(from).to_vec();
        while let Some(id) = stack.pop() {
            if set.insert(id.clone()) {
                stack.extend(self.dependents_of(&id).iter().cloned());
            }
        }
        // A subgraph of an acyclic graph cannot cycle.
        self.sort_subset(self.order.iter().filter(|id| set.contains(*id)))
            .expect("reachable subgraph of an acyclic graph has no cycle")
    }

    /// Kahn's algorithm over a subset of the nodes, deterministic by
    /// insertion index.
    fn sort_subset<'a>(
        &self,
        ids: impl Iterator<Item = &'a NodeId>,
    ) -> Result<Vec<Arc<ComponentNode>>, CycleError> {
        let index: FxHashMap<&NodeId, usize> =
            self.order.iter().enumerate().map(|(i, id)| (id, i)).collect();
        let subset: FxHashSet<&NodeId> = ids.collect();

        let mut remaining: FxHashMap<&NodeId, usize> = FxHashMap::default();
        // Min-heap on insertion index (BinaryHeap is a max-heap).
        let mut ready: BinaryHeap<std::cmp::Reverse<(usize, &NodeId)>> = BinaryHeap::new();
        for id in subset.iter().copied() {
            let unresolved = self.dependencies[id]
                .iter()
                .filter(|dep| subset.contains(dep))
                .count();
            remaining.insert(id, unresolved);
            if unresolved == 0 {
                ready.push(std::cmp::Reverse((index[id], id)));
            }
        }

        let mut sorted = Vec::with_capacity(subset.len());
        while let Some(std::cmp::Reverse((_, id))) = ready.pop() {
            sorted.push(self.nodes[id].clone());
            for dependent in self.dependents_of(id) {
                if let Some(unresolved) = remaining.get_mut(dependent) {
                    *unresolved -= 1;
                    if *unresolved == 0 {
                        let dependent = subset
                            .get(dependent)
                            .expect("dependent tracked in remaining is part of the subset");
                        ready.push(std::cmp::Reverse((index[dependent], *dependent)));
                    }
                }
            }
        }

        if sorted.len() == subset.len() {
            Ok(sorted)
        } else {
            let stuck: Vec<&NodeId> = remaining
                .iter()
                .filter(|(_, unresolved)| **unresolved > 0)
                .map(|(id, _)| *id)
                .collect();
            Err(CycleError {
                cycle: self.find_cycle(&stuck),
            })
        }
    }

    /// Walks dependency edges among `stuck` nodes until one repeats,
    /// producing a representative cycle.
    fn find_cycle(&self, stuck: &[&NodeId]) -> Vec<NodeId> {
        let stuck_set: FxHashSet<&NodeId> = stuck.iter().copied().collect();
        let start = stuck
            .iter()
            .min_by_key(|id| self.order.iter().position(|o| o == **id))
            .expect("a failed sort leaves at least one stuck node");

        let mut path: Vec<NodeId> = Vec::new();
        let mut seen: FxHashSet<NodeId> = FxHashSet::default();
        let mut current: NodeId = (*start).clone();
        loop {
            if !seen.insert(current.clone()) {
                let cycle_start = path.iter().position(|id| *id == current).unwrap_or(0);
                return path.split_off(cycle_start);
            }
            path.push(current.clone());
            // Every stuck node has at least one stuck dependency.
            current = self.dependencies[&current]
                .iter()
                .find(|dep| stuck_set.contains(dep))
                .expect("stuck node has a stuck dependency")
                .clone();
        }
    }
}
