//! Graph Nodes
//!
//! This module defines node identities, node kinds, and the edge entry the
//! graph keeps for every node that currently takes part in an edge.

use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexSet;

use crate::error::Result;

/// Monotonic version stamp. Drawn from one runtime-wide clock, so two
/// different writes never share a version.
pub type Version = u64;

/// Unique identifier for a node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The kind of node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// A source node. The only node with externally settable state.
    Atom,

    /// A cached pure function of other nodes.
    Derivation,

    /// A derivation with a custom write path.
    Lens,

    /// A leaf with a side-effecting callback.
    /// It has dependencies but never dependents.
    Reaction,
}

impl NodeKind {
    /// Whether nodes of this kind can be read (`get`) and derived from.
    pub fn is_derivable(self) -> bool {
        !matches!(self, NodeKind::Reaction)
    }
}

/// Capability shared by every node variant.
///
/// The graph only ever talks to nodes through this trait, so edges can
/// point at atoms, derivations and reactions of any value type.
pub(crate) trait Node {
    fn id(&self) -> NodeId;

    fn kind(&self) -> NodeKind;

    /// Bring the node up to date and return its current version.
    fn update(&self) -> Result<Version>;

    /// The node gained its first dependent.
    fn connect(&self) -> Result<()> {
        Ok(())
    }

    /// The node lost its last dependent.
    fn disconnect(&self) {}

    /// Revalidate after an upstream commit. Only reactions act on this.
    fn maybe_react(&self) -> Result<()> {
        Ok(())
    }
}

/// The graph's bookkeeping for one node.
///
/// An entry exists only while the node has at least one edge; the graph
/// drops it as soon as both edge sets are empty.
pub(crate) struct GraphNode {
    /// Strong handle so the sweep can reach the node.
    handle: Rc<dyn Node>,

    /// Nodes that this node reads from (parents).
    dependencies: IndexSet<NodeId>,

    /// Nodes that read from this node (children).
    /// Insertion ordered so sweeps are deterministic.
    dependents: IndexSet<NodeId>,
}

impl GraphNode {
    pub fn new(handle: Rc<dyn Node>) -> Self {
        Self {
            handle,
            dependencies: IndexSet::new(),
            dependents: IndexSet::new(),
        }
    }

    pub fn handle(&self) -> &Rc<dyn Node> {
        &self.handle
    }

    pub fn kind(&self) -> NodeKind {
        self.handle.kind()
    }

    pub fn add_dependency(&mut self, node_id: NodeId) -> bool {
        self.dependencies.insert(node_id)
    }

    pub fn remove_dependency(&mut self, node_id: NodeId) -> bool {
        self.dependencies.shift_remove(&node_id)
    }

    pub fn dependencies(&self) -> &IndexSet<NodeId> {
        &self.dependencies
    }

    pub fn add_dependent(&mut self, node_id: NodeId) -> bool {
        self.dependents.insert(node_id)
    }

    pub fn remove_dependent(&mut self, node_id: NodeId) -> bool {
        self.dependents.shift_remove(&node_id)
    }

    pub fn dependents(&self) -> &IndexSet<NodeId> {
        &self.dependents
    }

    /// No edge touches this node any more.
    pub fn is_detached(&self) -> bool {
        self.dependencies.is_empty() && self.dependents.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A node that does nothing but carry an identity.
    pub(crate) struct Stub {
        pub id: NodeId,
        pub kind: NodeKind,
    }

    impl Stub {
        pub fn new(kind: NodeKind) -> Rc<Self> {
            Rc::new(Self {
                id: NodeId::new(),
                kind,
            })
        }
    }

    impl Node for Stub {
        fn id(&self) -> NodeId {
            self.id
        }

        fn kind(&self) -> NodeKind {
            self.kind
        }

        fn update(&self) -> Result<Version> {
            Ok(0)
        }
    }

    #[test]
    fn node_ids_are_unique() {
        let id1 = NodeId::new();
        let id2 = NodeId::new();
        assert_ne!(id1, id2);
        assert_eq!(format!("{id1}"), format!("#{}", id1.raw()));
    }

    #[test]
    fn reactions_are_not_derivable() {
        assert!(NodeKind::Atom.is_derivable());
        assert!(NodeKind::Lens.is_derivable());
        assert!(!NodeKind::Reaction.is_derivable());
    }

    #[test]
    fn edge_sets_keep_insertion_order() {
        let mut node = GraphNode::new(Stub::new(NodeKind::Derivation));
        let dep1 = NodeId::new();
        let dep2 = NodeId::new();
        let dep3 = NodeId::new();

        assert!(node.add_dependent(dep2));
        assert!(node.add_dependent(dep1));
        assert!(!node.add_dependent(dep2));
        node.add_dependent(dep3);

        let order: Vec<_> = node.dependents().iter().copied().collect();
        assert_eq!(order, vec![dep2, dep1, dep3]);

        node.remove_dependent(dep1);
        let order: Vec<_> = node.dependents().iter().copied().collect();
        assert_eq!(order, vec![dep2, dep3]);
    }

    #[test]
    fn detached_once_both_sets_are_empty() {
        let mut node = GraphNode::new(Stub::new(NodeKind::Derivation));
        assert!(node.is_detached());

        let parent = NodeId::new();
        node.add_dependency(parent);
        assert!(!node.is_detached());

        node.remove_dependency(parent);
        assert!(node.is_detached());
    }
}
