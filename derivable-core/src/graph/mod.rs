//! Dependency Graph
//!
//! This module implements the observation edges that connect atoms,
//! derivations and reactions while something is watching them.
//!
//! # Overview
//!
//! The dependency graph is a directed acyclic graph (DAG) where:
//!
//! - Nodes are atoms, derivations (and lenses) or reactions
//! - Edges point from a parent to a child that read it: if A depends on B,
//!   there is an edge from B to A
//!
//! When an atom commits a change, we traverse the graph to find every
//! reaction reachable from it. Derivations on the way are not touched; they
//! revalidate lazily when the reactions pull their values.
//!
//! # Design Decisions
//!
//! 1. We use a centralized arena of edge sets keyed by node ID rather than
//!    pointers between nodes, so there are no reference cycles between
//!    parents and children.
//!
//! 2. Only observed nodes have entries. A derivation read outside of any
//!    reaction never appears here, so there is nothing to clean up.
//!
//! 3. We maintain both forward (dependencies) and reverse (dependents) edges
//!    so that detaching a subtree is a local operation.

mod edges;
mod node;

pub(crate) use edges::Graph;
pub(crate) use node::Node;
pub use node::{NodeId, NodeKind, Version};

#[cfg(test)]
pub(crate) use node::tests::Stub;
