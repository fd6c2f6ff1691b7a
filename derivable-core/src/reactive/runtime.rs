//! Reactive Runtime
//!
//! The runtime is the central coordinator that connects atoms, derivations
//! and reactions. It owns the observation graph, the version clock and the
//! global epoch, and it runs the notification sweep after a commit.
//!
//! # How It Works
//!
//! 1. Every accepted write draws a fresh version from the clock and bumps
//!    the epoch. A derivation validated at the current epoch is known to be
//!    fresh without looking at its parents.
//!
//! 2. A reaction starting attaches an edge to its source. A node that gains
//!    its first dependent connects to its own parents, recursively, so the
//!    edges reach down to every atom the reaction can observe.
//!
//! 3. When an atom commits, the runtime:
//!    a. Collects every reaction reachable from it, once each
//!    b. Asks each one to revalidate, in discovery order
//!    c. Derivations are lazy - they recompute only when a reaction pulls
//!
//! # Threading
//!
//! The runtime is thread-local. Each thread has its own graph and clocks,
//! and nodes are `!Send`, so a graph never crosses threads.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::{debug, trace, trace_span};

use crate::error::Result;
use crate::graph::{Graph, Node, NodeId, Version};

thread_local! {
    static RUNTIME: RuntimeState = RuntimeState::new();
}

struct RuntimeState {
    /// Global version. Moves whenever any visible value may have changed.
    epoch: Cell<u64>,

    /// Source of node versions.
    clock: Cell<Version>,

    /// Observation edges.
    graph: RefCell<Graph>,
}

impl RuntimeState {
    fn new() -> Self {
        Self {
            epoch: Cell::new(0),
            clock: Cell::new(0),
            graph: RefCell::new(Graph::new()),
        }
    }
}

fn with_graph<R>(f: impl FnOnce(&mut Graph) -> R) -> R {
    RUNTIME.with(|rt| f(&mut rt.graph.borrow_mut()))
}

/// The thread-local reactive runtime.
pub struct Runtime;

impl Runtime {
    /// The current global version.
    pub fn epoch() -> u64 {
        RUNTIME.with(|rt| rt.epoch.get())
    }

    /// Invalidate every derivation's fast path.
    pub(crate) fn bump_epoch() -> u64 {
        RUNTIME.with(|rt| {
            let next = rt.epoch.get() + 1;
            rt.epoch.set(next);
            trace!(epoch = next, "epoch bumped");
            next
        })
    }

    /// Draw a version no node has used before.
    pub(crate) fn next_version() -> Version {
        RUNTIME.with(|rt| {
            let next = rt.clock.get() + 1;
            rt.clock.set(next);
            next
        })
    }

    /// Record that `child` observes `parent`, connecting `parent` if this
    /// is its first observer.
    pub(crate) fn attach(parent: Rc<dyn Node>, child: Rc<dyn Node>) -> Result<()> {
        let parent_id = parent.id();
        let child_id = child.id();

        let first = with_graph(|graph| graph.add_edge(Rc::clone(&parent), child));
        trace!(parent = %parent_id, child = %child_id, first, "edge attached");

        if first {
            if let Err(err) = parent.connect() {
                Self::detach(parent_id, child_id);
                return Err(err);
            }
        }

        Ok(())
    }

    /// Remove the edge `parent -> child`, disconnecting `parent` if it has
    /// no observers left.
    pub(crate) fn detach(parent: NodeId, child: NodeId) {
        let orphan = with_graph(|graph| graph.remove_edge(parent, child));
        trace!(parent = %parent, child = %child, orphaned = orphan.is_some(), "edge detached");

        if let Some(orphan) = orphan {
            orphan.disconnect();
        }
    }

    /// Run one notification sweep over every reaction reachable from
    /// `roots`.
    pub(crate) fn propagate(roots: &[NodeId]) -> Result<()> {
        if roots.is_empty() {
            return Ok(());
        }

        let reactions = with_graph(|graph| graph.collect_reactions(roots));
        if reactions.is_empty() {
            return Ok(());
        }

        let span = trace_span!("sweep", roots = roots.len());
        let _enter = span.enter();
        debug!(reactions = reactions.len(), "notifying reactions");

        for reaction in reactions {
            reaction.maybe_react()?;
        }

        Ok(())
    }

    /// Number of nodes currently observing `node`.
    pub fn dependent_count(node: NodeId) -> usize {
        with_graph(|graph| graph.dependent_count(node))
    }

    /// Number of nodes `node` is currently attached to.
    pub fn dependency_count(node: NodeId) -> usize {
        with_graph(|graph| graph.dependency_count(node))
    }

    /// Total number of observation edges on this thread.
    pub fn edge_count() -> usize {
        with_graph(|graph| graph.edge_count())
    }

    /// Number of nodes touched by at least one edge.
    pub fn observed_node_count() -> usize {
        with_graph(|graph| graph.node_count())
    }
}

/// Raises a re-entrancy flag for the lifetime of the guard.
pub(crate) struct FlagGuard<'a> {
    flag: &'a Cell<bool>,
}

impl<'a> FlagGuard<'a> {
    pub fn raise(flag: &'a Cell<bool>) -> Self {
        flag.set(true);
        Self { flag }
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(false);
    }
}
