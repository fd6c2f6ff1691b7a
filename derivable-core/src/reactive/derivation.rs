//! Derivation Implementation
//!
//! A derivation is a cached value computed from other nodes. It re-runs its
//! function only when something it read last time has a new version.
//!
//! # How Derivations Work
//!
//! 1. On first access, the derivation runs its function inside a capture
//!    frame and caches the value along with every `(parent, version)` read.
//!
//! 2. If it was already validated in the current epoch, the cache is
//!    returned without looking at anything else.
//!
//! 3. Otherwise each recorded parent is brought up to date, in the order it
//!    was first read. The first parent whose version differs from the
//!    recorded one forces a recompute. If none differ, the cache is still
//!    good.
//!
//! 4. A recompute that produces a value equal to the cached one keeps the
//!    old version, so nodes downstream see no change.
//!
//! # Why This Matters
//!
//! Parents are checked in order and the check stops at the first mismatch,
//! so a branch the function no longer takes is never evaluated:
//!
//! - `cond ? a : b` last read `cond` and `a`
//! - `cond` flips, the derivation recomputes and now reads `cond` and `b`
//! - `a` is never evaluated again until `cond` flips back
//!
//! # Connection
//!
//! A derivation with at least one dependent is *connected*: it holds edges
//! to its parents so writes below it can reach the reactions above it. The
//! runtime connects and disconnects derivations as edges come and go.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use smallvec::SmallVec;
use tracing::trace;

use super::context::{capture_parents, Parents, ReactiveContext};
use super::derivable::{Derivable, Identified, Source};
use super::equality::Equality;
use super::react::{self, ReactHandle, ReactOptions};
use super::runtime::{FlagGuard, Runtime};
use crate::error::{Error, Result};
use crate::graph::{Node, NodeId, NodeKind, Version};

/// What a derivation knows about its cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    /// No dependents, so no edges. The cache is checked lazily on read.
    Disconnected,

    /// Validated in the current epoch and the last check kept the value.
    Unchanged,

    /// Validated in the current epoch and the last check produced a new
    /// value.
    Changed,

    /// Connected but not yet validated since the last write.
    Unknown,
}

type Deriver<T> = Rc<dyn Fn() -> Result<T>>;

struct DerivationState<T> {
    cached: Option<T>,
    version: Version,
    validated_at: Option<u64>,
    parents: Parents,
    changed: bool,
}

pub(crate) struct DerivationCore<T: 'static> {
    id: NodeId,
    kind: NodeKind,
    this: Weak<DerivationCore<T>>,
    pub(crate) deriver: Deriver<T>,
    equality: Equality<T>,
    state: RefCell<DerivationState<T>>,
    connected: Cell<bool>,
    evaluating: Cell<bool>,
}

impl<T: Clone + 'static> DerivationCore<T> {
    pub(crate) fn new(kind: NodeKind, deriver: Deriver<T>, equality: Equality<T>) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            id: NodeId::new(),
            kind,
            this: this.clone(),
            deriver,
            equality,
            state: RefCell::new(DerivationState {
                cached: None,
                version: 0,
                validated_at: None,
                parents: Parents::new(),
                changed: false,
            }),
            connected: Cell::new(false),
            evaluating: Cell::new(false),
        })
    }

    fn strong(&self) -> Rc<Self> {
        self.this
            .upgrade()
            .expect("derivation is alive while borrowed")
    }

    pub(crate) fn get(&self) -> Result<T> {
        let (value, version) = self.current()?;
        ReactiveContext::record(&self.as_node(), version);
        Ok(value)
    }

    fn cached(&self) -> T {
        self.state
            .borrow()
            .cached
            .clone()
            .expect("validated derivation should have a value")
    }

    /// Whether any recorded parent moved since the last evaluation.
    ///
    /// Stops at the first parent that did.
    fn parents_changed(&self) -> Result<bool> {
        let parents = {
            let state = self.state.borrow();
            if state.cached.is_none() {
                return Ok(true);
            }
            state.parents.clone()
        };

        for parent in &parents {
            if parent.node.update()? != parent.version {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn recompute(&self) -> Result<()> {
        let (result, parents) = {
            let _evaluating = FlagGuard::raise(&self.evaluating);
            capture_parents(|| (self.deriver)())
        };
        let value = result?;

        let (added, removed) = {
            let mut state = self.state.borrow_mut();
            let changed = match &state.cached {
                Some(old) => !self.equality.eq(old, &value),
                None => true,
            };
            if changed {
                state.version = Runtime::next_version();
            }
            state.cached = Some(value);
            state.validated_at = Some(Runtime::epoch());
            state.changed = changed;

            let old = std::mem::replace(&mut state.parents, parents);
            trace!(node = %self.id, changed, version = state.version, "derivation recomputed");

            if self.connected.get() {
                diff_parents(&old, &state.parents)
            } else {
                (SmallVec::new(), SmallVec::new())
            }
        };

        for parent in removed {
            Runtime::detach(parent, self.id);
        }
        if !added.is_empty() {
            self.attach_added(&added)?;
        }

        Ok(())
    }

    /// Attach newly read parents. If one fails to connect, the ones
    /// attached so far are detached again, the new parents are forgotten
    /// and the cache is dropped, so the next read starts over.
    fn attach_added(&self, added: &[Rc<dyn Node>]) -> Result<()> {
        let me = self.as_node();
        for (i, parent) in added.iter().enumerate() {
            if let Err(err) = Runtime::attach(Rc::clone(parent), Rc::clone(&me)) {
                for attached in &added[..i] {
                    Runtime::detach(attached.id(), self.id);
                }
                let mut state = self.state.borrow_mut();
                state
                    .parents
                    .retain(|p| !added.iter().any(|a| a.id() == p.id()));
                state.cached = None;
                state.validated_at = None;
                return Err(err);
            }
        }
        Ok(())
    }

    fn validity(&self) -> Validity {
        if !self.connected.get() {
            return Validity::Disconnected;
        }

        let state = self.state.borrow();
        match state.validated_at {
            Some(epoch) if epoch == Runtime::epoch() && state.changed => Validity::Changed,
            Some(epoch) if epoch == Runtime::epoch() => Validity::Unchanged,
            _ => Validity::Unknown,
        }
    }
}

/// Parents gained and lost between two evaluations.
fn diff_parents(
    old: &Parents,
    new: &Parents,
) -> (SmallVec<[Rc<dyn Node>; 4]>, SmallVec<[NodeId; 4]>) {
    let added = new
        .iter()
        .filter(|p| !old.iter().any(|o| o.id() == p.id()))
        .map(|p| Rc::clone(&p.node))
        .collect();
    let removed = old
        .iter()
        .filter(|o| !new.iter().any(|p| p.id() == o.id()))
        .map(|o| o.id())
        .collect();
    (added, removed)
}

impl<T: Clone + 'static> Node for DerivationCore<T> {
    fn id(&self) -> NodeId {
        self.id
    }

    fn kind(&self) -> NodeKind {
        self.kind
    }

    fn update(&self) -> Result<Version> {
        let epoch = Runtime::epoch();
        {
            let state = self.state.borrow();
            if state.cached.is_some() && state.validated_at == Some(epoch) {
                return Ok(state.version);
            }
        }

        if self.evaluating.get() {
            return Err(Error::cycle(format!(
                "derivation {} depends on itself",
                self.id
            )));
        }

        if self.parents_changed()? {
            self.recompute()?;
        } else {
            let mut state = self.state.borrow_mut();
            state.validated_at = Some(Runtime::epoch());
            state.changed = false;
        }

        Ok(self.state.borrow().version)
    }

    fn connect(&self) -> Result<()> {
        self.update()?;
        self.connected.set(true);

        let parents: SmallVec<[Rc<dyn Node>; 4]> = self
            .state
            .borrow()
            .parents
            .iter()
            .map(|p| Rc::clone(&p.node))
            .collect();
        let me = self.as_node();

        for (i, parent) in parents.iter().enumerate() {
            if let Err(err) = Runtime::attach(Rc::clone(parent), Rc::clone(&me)) {
                for attached in &parents[..i] {
                    Runtime::detach(attached.id(), self.id);
                }
                self.connected.set(false);
                return Err(err);
            }
        }

        trace!(node = %self.id, parents = parents.len(), "derivation connected");
        Ok(())
    }

    fn disconnect(&self) {
        if !self.connected.replace(false) {
            return;
        }

        let parents: SmallVec<[NodeId; 4]> =
            self.state.borrow().parents.iter().map(|p| p.id()).collect();
        for parent in parents {
            Runtime::detach(parent, self.id);
        }
        trace!(node = %self.id, "derivation disconnected");
    }
}

impl<T: Clone + 'static> Source<T> for DerivationCore<T> {
    fn current(&self) -> Result<(T, Version)> {
        let version = self.update()?;
        Ok((self.cached(), version))
    }

    fn equality(&self) -> Equality<T> {
        self.equality.clone()
    }

    fn as_node(&self) -> Rc<dyn Node> {
        self.strong()
    }
}

/// A cached value derived from other nodes.
///
/// Cloning a `Derivation` creates a new handle to the **same** node.
///
/// # Example
///
/// ```rust
/// use derivable_core::reactive::{atom, derive};
///
/// let name = atom(String::from("world"));
/// let greeting = derive({
///     let name = name.clone();
///     move || format!("hello, {}", name.get())
/// });
///
/// assert_eq!(greeting.get()?, "hello, world");
/// # Ok::<(), derivable_core::Error>(())
/// ```
pub struct Derivation<T: 'static> {
    core: Rc<DerivationCore<T>>,
}

/// Create a derivation from an infallible function.
pub fn derive<T, F>(f: F) -> Derivation<T>
where
    T: Clone + PartialEq + 'static,
    F: Fn() -> T + 'static,
{
    Derivation::new(f)
}

/// Create a derivation from a function that may fail.
pub fn try_derive<T, F>(f: F) -> Derivation<T>
where
    T: Clone + PartialEq + 'static,
    F: Fn() -> Result<T> + 'static,
{
    Derivation::try_new(f)
}

/// Create a derivation with a custom equality policy.
pub fn derive_with<T, F>(equality: Equality<T>, f: F) -> Derivation<T>
where
    T: Clone + 'static,
    F: Fn() -> Result<T> + 'static,
{
    Derivation::new_with_equality(equality, f)
}

impl<T: Clone + 'static> Derivation<T> {
    pub fn new(f: impl Fn() -> T + 'static) -> Self
    where
        T: PartialEq,
    {
        Self::try_new(move || Ok(f()))
    }

    pub fn try_new(f: impl Fn() -> Result<T> + 'static) -> Self
    where
        T: PartialEq,
    {
        Self::new_with_equality(Equality::partial_eq(), f)
    }

    pub fn new_with_equality(equality: Equality<T>, f: impl Fn() -> Result<T> + 'static) -> Self {
        Self {
            core: DerivationCore::new(NodeKind::Derivation, Rc::new(f), equality),
        }
    }

    /// A new derivation running the same function under `equality`.
    pub fn with_equality(&self, equality: Equality<T>) -> Self {
        Self {
            core: DerivationCore::new(NodeKind::Derivation, Rc::clone(&self.core.deriver), equality),
        }
    }

    pub fn id(&self) -> NodeId {
        self.core.id
    }

    /// Read the value, recording a dependency when called inside another
    /// derivation.
    pub fn get(&self) -> Result<T> {
        self.core.get()
    }

    pub fn get_untracked(&self) -> Result<T> {
        self.core.current().map(|(value, _)| value)
    }

    /// Bring the derivation up to date and return its version.
    pub fn version(&self) -> Result<Version> {
        self.core.update()
    }

    pub fn validity(&self) -> Validity {
        self.core.validity()
    }

    pub fn is_connected(&self) -> bool {
        self.core.connected.get()
    }

    pub fn equality(&self) -> Equality<T> {
        self.core.equality.clone()
    }

    pub fn derivable(&self) -> Derivable<T> {
        Derivable::from_source(self.core.clone())
    }

    pub fn map<U>(&self, f: impl Fn(&T) -> U + 'static) -> Derivation<U>
    where
        U: Clone + PartialEq + 'static,
    {
        self.derivable().map(f)
    }

    pub fn react(&self, callback: impl FnMut(&T) -> Result<()> + 'static) -> Result<ReactHandle> {
        react::react(self.derivable(), callback, ReactOptions::default())
    }

    pub fn react_with(
        &self,
        callback: impl FnMut(&T) -> Result<()> + 'static,
        options: ReactOptions,
    ) -> Result<ReactHandle> {
        react::react(self.derivable(), callback, options)
    }
}

impl<T: 'static> Clone for Derivation<T> {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
        }
    }
}

impl<T: 'static> Identified for Derivation<T> {
    fn id(&self) -> NodeId {
        self.core.id
    }

    fn kind(&self) -> NodeKind {
        self.core.kind
    }
}

impl<T: Clone + 'static> From<Derivation<T>> for Derivable<T> {
    fn from(derivation: Derivation<T>) -> Self {
        derivation.derivable()
    }
}

impl<T: Clone + 'static> From<&Derivation<T>> for Derivable<T> {
    fn from(derivation: &Derivation<T>) -> Self {
        derivation.derivable()
    }
}

impl<T: 'static> fmt::Debug for Derivation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.core.state.borrow();
        f.debug_struct("Derivation")
            .field("id", &self.core.id)
            .field("version", &state.version)
            .field("has_value", &state.cached.is_some())
            .field("connected", &self.core.connected.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{atom, transact};

    fn counted<T: Clone + PartialEq + 'static>(
        runs: &Rc<Cell<u32>>,
        f: impl Fn() -> T + 'static,
    ) -> Derivation<T> {
        let runs = Rc::clone(runs);
        derive(move || {
            runs.set(runs.get() + 1);
            f()
        })
    }

    #[test]
    fn derivation_computes_on_first_access() {
        let runs = Rc::new(Cell::new(0));
        let d = counted(&runs, || 42);

        assert_eq!(runs.get(), 0);
        assert_eq!(d.get().unwrap(), 42);
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn derivation_caches_while_parents_are_unchanged() {
        let a = atom(1);
        let runs = Rc::new(Cell::new(0));
        let d = counted(&runs, {
            let a = a.clone();
            move || a.get() * 10
        });

        assert_eq!(d.get().unwrap(), 10);
        assert_eq!(d.get().unwrap(), 10);
        assert_eq!(runs.get(), 1);

        let unrelated = atom(0);
        unrelated.set(1).unwrap();
        assert_eq!(d.get().unwrap(), 10);
        assert_eq!(runs.get(), 1);

        a.set(2).unwrap();
        assert_eq!(d.get().unwrap(), 20);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn equal_recompute_keeps_version() {
        let a = atom(3);
        let parity = derive({
            let a = a.clone();
            move || a.get() % 2
        });

        let v1 = parity.version().unwrap();
        a.set(5).unwrap();
        assert_eq!(parity.version().unwrap(), v1);

        a.set(6).unwrap();
        assert_ne!(parity.version().unwrap(), v1);
    }

    #[test]
    fn dead_branch_is_not_evaluated() {
        let cond = atom(true);
        let left = atom(1);
        let right_runs = Rc::new(Cell::new(0));
        let right = counted(&right_runs, || 2);

        let pick = derive({
            let (cond, left, right) = (cond.clone(), left.clone(), right.clone());
            move || {
                if cond.get() {
                    left.get()
                } else {
                    right.get().unwrap_or_default()
                }
            }
        });

        assert_eq!(pick.get().unwrap(), 1);
        assert_eq!(right_runs.get(), 0);

        cond.set(false).unwrap();
        assert_eq!(pick.get().unwrap(), 2);
        assert_eq!(right_runs.get(), 1);

        cond.set(true).unwrap();
        left.set(5).unwrap();
        assert_eq!(pick.get().unwrap(), 5);
        assert_eq!(right_runs.get(), 1);
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let slot: Rc<RefCell<Option<Derivation<i32>>>> = Rc::new(RefCell::new(None));
        let d = try_derive({
            let slot = Rc::clone(&slot);
            move || {
                let me = slot.borrow().clone().expect("slot filled");
                me.get()
            }
        });
        *slot.borrow_mut() = Some(d.clone());

        let err = d.get().unwrap_err();
        assert!(err.is_cycle());
        assert!(!d.core.evaluating.get());
        slot.borrow_mut().take();
    }

    #[test]
    fn failed_evaluation_caches_nothing() {
        let fail = atom(true);
        let d = try_derive({
            let fail = fail.clone();
            move || {
                if fail.get() {
                    Err(Error::misuse("not yet"))
                } else {
                    Ok(7)
                }
            }
        });

        assert!(d.get().is_err());
        assert!(d.get().is_err());

        fail.set(false).unwrap();
        assert_eq!(d.get().unwrap(), 7);
    }

    #[test]
    fn transaction_reads_pending_values() {
        let a = atom(1);
        let d = derive({
            let a = a.clone();
            move || a.get() + 100
        });
        assert_eq!(d.get().unwrap(), 101);

        let result = transact(|| {
            a.set(2)?;
            assert_eq!(d.get()?, 102);
            Err::<(), _>(Error::Aborted)
        })
        .unwrap();

        assert_eq!(result, None);
        assert_eq!(d.get().unwrap(), 101);
    }

    #[test]
    fn custom_equality_absorbs_changes() {
        let a = atom(1.0_f64);
        let rounded = derive_with(Equality::new(|x: &f64, y: &f64| (x - y).abs() < 1.0), {
            let a = a.clone();
            move || Ok(a.get())
        });

        let v = rounded.version().unwrap();
        a.set(1.5).unwrap();
        assert_eq!(rounded.version().unwrap(), v);
        assert_eq!(rounded.get().unwrap(), 1.0);
    }

    #[test]
    fn disconnected_derivation_reports_validity() {
        let d = derive(|| 1);
        assert_eq!(d.validity(), Validity::Disconnected);
        assert!(!d.is_connected());
    }

    #[test]
    fn connected_validity_follows_writes() {
        let a = atom(2);
        let other = atom(0);
        let parity = derive({
            let a = a.clone();
            move || a.get() % 2
        });
        let handle = parity.react(|_: &i32| Ok(())).unwrap();
        assert_eq!(parity.validity(), Validity::Changed);

        a.set(3).unwrap();
        assert_eq!(parity.validity(), Validity::Changed);

        a.set(5).unwrap();
        assert_eq!(parity.validity(), Validity::Unchanged);

        // Nothing observing `other` reaches the derivation.
        other.set(1).unwrap();
        assert_eq!(parity.validity(), Validity::Unknown);

        assert_eq!(parity.get().unwrap(), 1);
        assert_eq!(parity.validity(), Validity::Unchanged);

        handle.stop();
        assert_eq!(parity.validity(), Validity::Disconnected);
    }

    struct Unconnectable {
        id: NodeId,
    }

    impl Node for Unconnectable {
        fn id(&self) -> NodeId {
            self.id
        }

        fn kind(&self) -> NodeKind {
            NodeKind::Atom
        }

        fn update(&self) -> Result<Version> {
            Ok(0)
        }

        fn connect(&self) -> Result<()> {
            Err(Error::misuse("cannot connect"))
        }
    }

    #[test]
    fn failed_attach_forgets_new_parents() {
        let gate = atom(false);
        let stuck: Rc<dyn Node> = Rc::new(Unconnectable { id: NodeId::new() });
        let d = derive({
            let (gate, stuck) = (gate.clone(), Rc::clone(&stuck));
            move || {
                if gate.get() {
                    ReactiveContext::record(&stuck, 0);
                    1
                } else {
                    0
                }
            }
        });
        let handle = d.react(|_: &i32| Ok(())).unwrap();
        assert_eq!(Runtime::dependency_count(d.id()), 1);

        assert!(gate.set(true).is_err());
        assert_eq!(Runtime::dependent_count(stuck.id()), 0);
        assert_eq!(Runtime::dependency_count(d.id()), 1);

        gate.set(false).unwrap();
        assert_eq!(d.get().unwrap(), 0);
        assert_eq!(Runtime::dependency_count(d.id()), 1);

        handle.stop();
        assert_eq!(Runtime::dependency_count(d.id()), 0);
    }
}
