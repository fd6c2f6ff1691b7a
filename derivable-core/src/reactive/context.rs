//! Dependency Capture
//!
//! The capture context records which nodes are read while a derivation's
//! function runs. This is how dependencies are discovered without the
//! function declaring them.
//!
//! # Implementation
//!
//! We use a thread-local stack of frames. Evaluating a derivation pushes a
//! fresh frame, runs the function, and pops the frame together with every
//! `(node, version)` pair that was read. Every `get` appends itself to the
//! top frame, if there is one.
//!
//! This design supports nested capture: a derivation that reads another
//! derivation which needs recomputing pushes a second frame on top, and the
//! outer frame only sees the inner derivation itself, not its parents.
//!
//! An untracked frame masks everything below it, so reads inside
//! [`untracked`] are invisible to the surrounding derivation.

use std::cell::RefCell;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::graph::{Node, NodeId, Version};

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<ContextEntry>> = const { RefCell::new(Vec::new()) };
}

/// One recorded read: the node and its version at the time of the read.
#[derive(Clone)]
pub(crate) struct Parent {
    pub node: Rc<dyn Node>,
    pub version: Version,
}

impl Parent {
    pub fn id(&self) -> NodeId {
        self.node.id()
    }
}

/// Ordered, de-duplicated reads of one evaluation.
pub(crate) type Parents = SmallVec<[Parent; 4]>;

enum ContextEntry {
    Capture(Parents),
    Untracked,
}

/// Guard that pops the frame when dropped.
///
/// This keeps the stack balanced even if the captured function panics.
pub(crate) struct ReactiveContext {
    depth: usize,
    popped: bool,
}

impl ReactiveContext {
    /// Push a recording frame.
    pub fn enter() -> Self {
        Self::push(ContextEntry::Capture(Parents::new()))
    }

    /// Push a frame that hides reads from every frame below it.
    pub fn enter_untracked() -> Self {
        Self::push(ContextEntry::Untracked)
    }

    fn push(entry: ContextEntry) -> Self {
        let depth = CONTEXT_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.push(entry);
            stack.len()
        });

        Self {
            depth,
            popped: false,
        }
    }

    /// Pop the frame, returning what it recorded.
    pub fn finish(mut self) -> Parents {
        self.popped = true;
        match self.pop() {
            Some(ContextEntry::Capture(parents)) => parents,
            _ => Parents::new(),
        }
    }

    fn pop(&self) -> Option<ContextEntry> {
        CONTEXT_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            debug_assert_eq!(
                stack.len(),
                self.depth,
                "capture frames popped out of order"
            );
            stack.pop()
        })
    }

    /// Whether reads are currently being recorded.
    pub fn is_capturing() -> bool {
        CONTEXT_STACK.with(|stack| matches!(stack.borrow().last(), Some(ContextEntry::Capture(_))))
    }

    /// Record a read of `node` at `version` in the top frame.
    ///
    /// Repeated reads of the same node keep the first position.
    pub fn record(node: &Rc<dyn Node>, version: Version) {
        CONTEXT_STACK.with(|stack| {
            if let Some(ContextEntry::Capture(parents)) = stack.borrow_mut().last_mut() {
                let id = node.id();
                if !parents.iter().any(|parent| parent.id() == id) {
                    parents.push(Parent {
                        node: Rc::clone(node),
                        version,
                    });
                }
            }
        });
    }
}

impl Drop for ReactiveContext {
    fn drop(&mut self) {
        if !self.popped {
            self.pop();
        }
    }
}

/// Run `f` in a fresh frame and return its result with the reads it made.
pub(crate) fn capture_parents<R>(f: impl FnOnce() -> R) -> (R, Parents) {
    let ctx = ReactiveContext::enter();
    let result = f();
    (result, ctx.finish())
}

/// Run `f` and report every node it read, in order, with the version seen.
pub fn capture<R>(f: impl FnOnce() -> R) -> (R, Vec<(NodeId, Version)>) {
    let (result, parents) = capture_parents(f);
    let reads = parents
        .iter()
        .map(|parent| (parent.id(), parent.version))
        .collect();
    (result, reads)
}

/// Run `f` without recording any of its reads as dependencies.
pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
    let _ctx = ReactiveContext::enter_untracked();
    f()
}

/// Whether the current code runs inside a deriver that records reads.
pub fn is_capturing() -> bool {
    ReactiveContext::is_capturing()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{NodeKind, Stub};

    fn read(node: &Rc<Stub>, version: Version) {
        let node: Rc<dyn Node> = node.clone();
        ReactiveContext::record(&node, version);
    }

    #[test]
    fn capture_records_reads_in_order() {
        let a = Stub::new(NodeKind::Atom);
        let b = Stub::new(NodeKind::Atom);

        let (value, reads) = capture(|| {
            read(&b, 2);
            read(&a, 1);
            read(&b, 9);
            42
        });

        assert_eq!(value, 42);
        assert_eq!(reads, vec![(b.id, 2), (a.id, 1)]);
    }

    #[test]
    fn nested_frames_are_isolated() {
        let outer = Stub::new(NodeKind::Atom);
        let inner = Stub::new(NodeKind::Atom);

        let (_, outer_reads) = capture(|| {
            read(&outer, 1);
            let (_, inner_reads) = capture(|| read(&inner, 5));
            assert_eq!(inner_reads, vec![(inner.id, 5)]);
        });

        assert_eq!(outer_reads, vec![(outer.id, 1)]);
    }

    #[test]
    fn untracked_hides_reads() {
        let a = Stub::new(NodeKind::Atom);

        let (_, reads) = capture(|| {
            assert!(is_capturing());
            untracked(|| {
                assert!(!is_capturing());
                read(&a, 1);
            });
        });

        assert!(reads.is_empty());
        assert!(!is_capturing());
    }

    #[test]
    fn reads_outside_capture_are_dropped() {
        let a = Stub::new(NodeKind::Atom);
        read(&a, 1);
        assert!(!is_capturing());
    }

    #[test]
    fn stack_is_restored_after_panic() {
        let result = std::panic::catch_unwind(|| {
            capture(|| panic!("deriver failed"));
        });
        assert!(result.is_err());
        assert!(!is_capturing());
        CONTEXT_STACK.with(|stack| assert!(stack.borrow().is_empty()));
    }
}
