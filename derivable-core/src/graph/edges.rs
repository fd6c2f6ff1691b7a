//! Edge Arena
//!
//! The graph stores observation edges between nodes, keyed by node ID.
//! Nodes never own each other through this structure; an entry only lives
//! while some edge touches it.
//!
//! # Edge lifecycle
//!
//! Edges are attached lazily and detached eagerly:
//!
//! 1. A reaction starting adds an edge from its source to itself.
//! 2. If that source gained its first dependent, the caller connects it,
//!    which recursively adds edges from the source's own parents.
//! 3. Removing the last dependent of a node hands the node back to the
//!    caller, which disconnects it from its parents in turn.
//!
//! This way the edge sets always describe exactly the part of the graph
//! that some active reaction can observe.

use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use indexmap::IndexSet;

use super::node::{GraphNode, Node, NodeId, NodeKind};

/// All nodes that currently participate in an edge, indexed by ID.
pub(crate) struct Graph {
    nodes: HashMap<NodeId, GraphNode>,
}

impl Graph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
        }
    }

    /// Add an edge: `child` observes `parent`.
    ///
    /// Returns `true` when this is the first dependent of `parent`, in
    /// which case the caller is responsible for connecting `parent`.
    pub fn add_edge(&mut self, parent: Rc<dyn Node>, child: Rc<dyn Node>) -> bool {
        let parent_id = parent.id();
        let child_id = child.id();

        self.nodes
            .entry(child_id)
            .or_insert_with(|| GraphNode::new(child))
            .add_dependency(parent_id);

        let entry = self
            .nodes
            .entry(parent_id)
            .or_insert_with(|| GraphNode::new(parent));
        let first = entry.dependents().is_empty();
        let inserted = entry.add_dependent(child_id);

        first && inserted
    }

    /// Remove an edge.
    ///
    /// Returns the parent's handle when it just lost its last dependent, so
    /// the caller can disconnect it from its own parents.
    pub fn remove_edge(&mut self, parent: NodeId, child: NodeId) -> Option<Rc<dyn Node>> {
        if let Some(child_node) = self.nodes.get_mut(&child) {
            child_node.remove_dependency(parent);
        }
        self.prune(child);

        let parent_node = self.nodes.get_mut(&parent)?;
        if !parent_node.remove_dependent(child) || !parent_node.dependents().is_empty() {
            return None;
        }

        let handle = Rc::clone(parent_node.handle());
        self.prune(parent);
        Some(handle)
    }

    /// Drop the entry for `node_id` if no edge touches it any more.
    fn prune(&mut self, node_id: NodeId) {
        if self.nodes.get(&node_id).is_some_and(GraphNode::is_detached) {
            self.nodes.remove(&node_id);
        }
    }

    /// Collect every reaction reachable from `roots` through dependent
    /// edges, in breadth-first discovery order, without duplicates.
    pub fn collect_reactions(&self, roots: &[NodeId]) -> Vec<Rc<dyn Node>> {
        let mut reactions = IndexSet::new();
        let mut visited = HashSet::new();
        let mut queue: VecDeque<NodeId> = VecDeque::new();

        for root in roots {
            if let Some(node) = self.nodes.get(root) {
                queue.extend(node.dependents().iter().copied());
            }
        }

        while let Some(node_id) = queue.pop_front() {
            if !visited.insert(node_id) {
                continue;
            }

            let Some(node) = self.nodes.get(&node_id) else {
                continue;
            };

            if node.kind() == NodeKind::Reaction {
                reactions.insert(node_id);
            } else {
                queue.extend(node.dependents().iter().copied());
            }
        }

        reactions
            .into_iter()
            .filter_map(|id| self.nodes.get(&id).map(|node| Rc::clone(node.handle())))
            .collect()
    }

    /// Number of nodes observing `node_id`.
    pub fn dependent_count(&self, node_id: NodeId) -> usize {
        self.nodes
            .get(&node_id)
            .map_or(0, |node| node.dependents().len())
    }

    /// Number of nodes `node_id` is attached to as an observer.
    pub fn dependency_count(&self, node_id: NodeId) -> usize {
        self.nodes
            .get(&node_id)
            .map_or(0, |node| node.dependencies().len())
    }

    /// Total number of edges in the graph.
    pub fn edge_count(&self) -> usize {
        self.nodes.values().map(|node| node.dependents().len()).sum()
    }

    /// Get the total number of nodes with at least one edge.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}
