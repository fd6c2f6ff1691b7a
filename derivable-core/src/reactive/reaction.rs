//! Reaction Implementation
//!
//! A reaction runs a callback with the value of a source whenever that
//! value changes. Reactions are the only eager part of the engine: they
//! are what pulls derivations up to date after a write.
//!
//! # How Reactions Work
//!
//! 1. Starting a reaction attaches it to its source, which connects the
//!    source and everything below it, then fires the callback once with
//!    the current value.
//!
//! 2. After a commit, the runtime asks every reachable reaction to
//!    revalidate. The reaction brings its source up to date and fires only
//!    if both the version and the value (under the source's equality)
//!    differ from what it last saw.
//!
//! 3. A reaction that is notified while its own callback is running is
//!    part of a cycle, and the sweep fails with [`Error::Cycle`].
//!
//! # Governors
//!
//! A reaction may be *adopted* by another reaction, its governor. Before a
//! governed reaction decides whether to fire, its governor gets to react
//! first, so a governor that stops its child in response to the same write
//! prevents the child from ever seeing it.
//!
//! Governors are held weakly. A reaction keeps its governor alive only
//! through the graph while the governor is active.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::debug;

use super::context::untracked;
use super::derivable::{Derivable, Identified};
use super::runtime::{FlagGuard, Runtime};
use crate::error::{Error, Result};
use crate::graph::{Node, NodeId, NodeKind, Version};

type Hook = Box<dyn FnMut()>;

/// The typed half of a reaction: its source and callback.
trait ReactionBody {
    /// Evaluate the source and fire the callback if due.
    ///
    /// Returns whether the callback ran.
    fn react(&mut self, force: bool, handle: &Reaction) -> Result<bool>;
}

struct Body<T: 'static> {
    source: Derivable<T>,
    last: Option<(T, Version)>,
    callback: Box<dyn FnMut(&T, &Reaction) -> Result<()>>,
}

impl<T: Clone + 'static> ReactionBody for Body<T> {
    fn react(&mut self, force: bool, handle: &Reaction) -> Result<bool> {
        let (value, version) = self.source.current()?;

        if !force {
            if let Some((last, last_version)) = &self.last {
                if *last_version == version {
                    return Ok(false);
                }
                if self.source.equality().eq(last, &value) {
                    self.last = Some((value, version));
                    return Ok(false);
                }
            }
        }

        self.last = Some((value.clone(), version));
        (self.callback)(&value, handle)?;
        Ok(true)
    }
}

#[derive(Clone, Copy)]
enum HookKind {
    Start,
    Stop,
}

#[derive(Default)]
struct Hooks {
    on_start: Option<Hook>,
    on_stop: Option<Hook>,
}

impl Hooks {
    fn slot(&mut self, which: HookKind) -> &mut Option<Hook> {
        match which {
            HookKind::Start => &mut self.on_start,
            HookKind::Stop => &mut self.on_stop,
        }
    }
}

pub(crate) struct ReactionCore {
    id: NodeId,
    this: Weak<ReactionCore>,
    source: Rc<dyn Node>,
    body: RefCell<Box<dyn ReactionBody>>,
    governor: RefCell<Option<Weak<ReactionCore>>>,
    active: Cell<bool>,
    reacting: Cell<bool>,
    hooks: RefCell<Hooks>,
}

impl ReactionCore {
    fn strong(&self) -> Rc<Self> {
        self.this.upgrade().expect("reaction is alive while borrowed")
    }

    fn governor(&self) -> Option<Rc<ReactionCore>> {
        self.governor.borrow().as_ref().and_then(Weak::upgrade)
    }

    fn start(&self) -> Result<()> {
        if self.reacting.get() {
            return Err(Error::reaction_cycle(self.id));
        }
        if self.active.get() {
            return Err(Error::misuse(format!(
                "reaction {} is already started",
                self.id
            )));
        }

        self.active.set(true);
        if let Err(err) = Runtime::attach(Rc::clone(&self.source), self.strong()) {
            self.active.set(false);
            return Err(err);
        }
        debug!(reaction = %self.id, source = %self.source.id(), "reaction started");

        self.run_hook(HookKind::Start);
        self.run(true).map(|_| ())
    }

    fn stop(&self) {
        if !self.active.replace(false) {
            return;
        }

        Runtime::detach(self.source.id(), self.id);
        debug!(reaction = %self.id, "reaction stopped");

        self.run_hook(HookKind::Stop);
    }

    /// Take the hook out while it runs so it may start or stop this
    /// reaction.
    fn run_hook(&self, which: HookKind) {
        let taken = self.hooks.borrow_mut().slot(which).take();
        if let Some(mut hook) = taken {
            untracked(|| hook());
            let mut hooks = self.hooks.borrow_mut();
            let slot = hooks.slot(which);
            if slot.is_none() {
                *slot = Some(hook);
            }
        }
    }

    fn revalidate(&self) -> Result<()> {
        if !self.active.get() {
            return Ok(());
        }
        if self.reacting.get() {
            return Err(Error::reaction_cycle(self.id));
        }

        if let Some(governor) = self.governor() {
            if !governor.reacting.get() {
                governor.revalidate()?;
            }
            if !self.active.get() {
                return Ok(());
            }
        }

        self.run(false).map(|_| ())
    }

    fn run(&self, force: bool) -> Result<bool> {
        if self.reacting.get() {
            return Err(Error::reaction_cycle(self.id));
        }

        let _reacting = FlagGuard::raise(&self.reacting);
        let handle = Reaction {
            core: self.strong(),
        };
        untracked(|| self.body.borrow_mut().react(force, &handle))
    }
}

impl Node for ReactionCore {
    fn id(&self) -> NodeId {
        self.id
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Reaction
    }

    fn update(&self) -> Result<Version> {
        self.source.update()
    }

    fn maybe_react(&self) -> Result<()> {
        self.revalidate()
    }
}

/// A side effect that runs whenever a source's value changes.
///
/// Cloning a `Reaction` creates a new handle to the **same** reaction.
///
/// # Example
///
/// ```rust
/// use std::cell::RefCell;
/// use std::rc::Rc;
/// use derivable_core::reactive::{atom, Reaction};
///
/// let count = atom(1);
/// let seen = Rc::new(RefCell::new(Vec::new()));
///
/// let log = Rc::clone(&seen);
/// let reaction = Reaction::new(&count, move |v: &i32| {
///     log.borrow_mut().push(*v);
///     Ok(())
/// });
///
/// reaction.start()?;
/// count.set(2)?;
/// reaction.stop();
/// count.set(3)?;
///
/// assert_eq!(*seen.borrow(), vec![1, 2]);
/// # Ok::<(), derivable_core::Error>(())
/// ```
#[derive(Clone)]
pub struct Reaction {
    core: Rc<ReactionCore>,
}

/// A non-owning handle to a [`Reaction`].
#[derive(Clone)]
pub struct WeakReaction {
    core: Weak<ReactionCore>,
}

impl WeakReaction {
    pub fn upgrade(&self) -> Option<Reaction> {
        self.core.upgrade().map(|core| Reaction { core })
    }
}

impl Reaction {
    /// Create a stopped reaction.
    pub fn new<T, S>(source: S, mut callback: impl FnMut(&T) -> Result<()> + 'static) -> Self
    where
        T: Clone + 'static,
        S: Into<Derivable<T>>,
    {
        Self::with_handle(source, move |value, _| callback(value))
    }

    /// Create a stopped reaction whose callback also receives a handle to
    /// the reaction itself.
    pub fn with_handle<T, S>(
        source: S,
        callback: impl FnMut(&T, &Reaction) -> Result<()> + 'static,
    ) -> Self
    where
        T: Clone + 'static,
        S: Into<Derivable<T>>,
    {
        let source = source.into();
        let node = source.node();
        let body = Body {
            source,
            last: None,
            callback: Box::new(callback),
        };

        let core = Rc::new_cyclic(|this| ReactionCore {
            id: NodeId::new(),
            this: this.clone(),
            source: node,
            body: RefCell::new(Box::new(body)),
            governor: RefCell::new(None),
            active: Cell::new(false),
            reacting: Cell::new(false),
            hooks: RefCell::new(Hooks::default()),
        });

        Self { core }
    }

    pub fn id(&self) -> NodeId {
        self.core.id
    }

    /// Attach to the source and fire once with its current value.
    ///
    /// Errors with [`Error::Misuse`] when already started.
    pub fn start(&self) -> Result<()> {
        self.core.start()
    }

    /// Detach from the source. Stopping a stopped reaction does nothing.
    pub fn stop(&self) {
        self.core.stop()
    }

    /// Fire the callback with the current value, changed or not.
    pub fn force(&self) -> Result<()> {
        self.core.run(true).map(|_| ())
    }

    pub fn is_active(&self) -> bool {
        self.core.active.get()
    }

    pub fn is_reacting(&self) -> bool {
        self.core.reacting.get()
    }

    /// Make this reaction the governor of `child`.
    ///
    /// Errors with [`Error::Misuse`] if `child` already has a governor, and
    /// with [`Error::Cycle`] if `child` governs this reaction.
    pub fn adopt(&self, child: &Reaction) -> Result<()> {
        if child.core.governor().is_some() {
            return Err(Error::misuse(format!(
                "reaction {} already has a governor",
                child.core.id
            )));
        }

        let mut cursor = Some(Rc::clone(&self.core));
        while let Some(current) = cursor {
            if Rc::ptr_eq(&current, &child.core) {
                return Err(Error::cycle(format!(
                    "reaction {} cannot govern its own governor {}",
                    self.core.id, child.core.id
                )));
            }
            cursor = current.governor();
        }

        *child.core.governor.borrow_mut() = Some(Rc::downgrade(&self.core));
        Ok(())
    }

    /// Release this reaction from its governor.
    pub fn orphan(&self) {
        self.core.governor.borrow_mut().take();
    }

    pub fn governor(&self) -> Option<Reaction> {
        self.core.governor().map(|core| Reaction { core })
    }

    /// Run `hook` every time this reaction starts.
    pub fn set_on_start(&self, hook: impl FnMut() + 'static) {
        self.core.hooks.borrow_mut().on_start = Some(Box::new(hook));
    }

    /// Run `hook` every time this reaction stops.
    pub fn set_on_stop(&self, hook: impl FnMut() + 'static) {
        self.core.hooks.borrow_mut().on_stop = Some(Box::new(hook));
    }

    pub fn downgrade(&self) -> WeakReaction {
        WeakReaction {
            core: Rc::downgrade(&self.core),
        }
    }

    pub(crate) fn set_hooks(&self, on_start: Option<Hook>, on_stop: Option<Hook>) {
        let mut hooks = self.core.hooks.borrow_mut();
        hooks.on_start = on_start;
        hooks.on_stop = on_stop;
    }
}

impl Identified for Reaction {
    fn id(&self) -> NodeId {
        self.core.id
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Reaction
    }
}

impl PartialEq for Reaction {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.core, &other.core)
    }
}

impl Eq for Reaction {}

impl fmt::Debug for Reaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reaction")
            .field("id", &self.core.id)
            .field("source", &self.core.source.id())
            .field("active", &self.core.active.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{atom, derive, Atom};

    fn recorder<T: Clone + 'static>(source: &Atom<T>) -> (Reaction, Rc<RefCell<Vec<T>>>) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&seen);
        let reaction = Reaction::new(source, move |v: &T| {
            log.borrow_mut().push(v.clone());
            Ok(())
        });
        (reaction, seen)
    }

    #[test]
    fn start_fires_once_then_on_change() {
        let a = atom(1);
        let (r, seen) = recorder(&a);

        r.start().unwrap();
        assert!(r.is_active());
        assert_eq!(*seen.borrow(), vec![1]);

        a.set(1).unwrap();
        a.set(2).unwrap();
        assert_eq!(*seen.borrow(), vec![1, 2]);
    }

    #[test]
    fn double_start_is_misuse() {
        let a = atom(0);
        let (r, _) = recorder(&a);

        r.start().unwrap();
        assert!(matches!(r.start(), Err(Error::Misuse { .. })));
    }

    #[test]
    fn stop_detaches_and_is_idempotent() {
        let a = atom(0);
        let (r, seen) = recorder(&a);

        r.start().unwrap();
        assert_eq!(Runtime::dependent_count(a.id()), 1);

        r.stop();
        r.stop();
        assert_eq!(Runtime::dependent_count(a.id()), 0);

        a.set(5).unwrap();
        assert_eq!(*seen.borrow(), vec![0]);
    }

    #[test]
    fn force_fires_without_change() {
        let a = atom("x");
        let (r, seen) = recorder(&a);

        r.start().unwrap();
        r.force().unwrap();
        assert_eq!(*seen.borrow(), vec!["x", "x"]);
    }

    #[test]
    fn equal_derived_value_does_not_fire() {
        let a = atom(2);
        let parity = derive({
            let a = a.clone();
            move || a.get() % 2
        });

        let fired = Rc::new(Cell::new(0));
        let count = Rc::clone(&fired);
        let r = Reaction::new(&parity, move |_: &i32| {
            count.set(count.get() + 1);
            Ok(())
        });

        r.start().unwrap();
        a.set(4).unwrap();
        a.set(6).unwrap();
        assert_eq!(fired.get(), 1);

        a.set(7).unwrap();
        assert_eq!(fired.get(), 2);
    }

    #[test]
    fn hooks_run_on_start_and_stop() {
        let a = atom(0);
        let (r, _) = recorder(&a);
        let events = Rc::new(RefCell::new(Vec::new()));

        let log = Rc::clone(&events);
        r.set_on_start(move || log.borrow_mut().push("start"));
        let log = Rc::clone(&events);
        r.set_on_stop(move || log.borrow_mut().push("stop"));

        r.start().unwrap();
        r.stop();
        r.start().unwrap();
        assert_eq!(*events.borrow(), vec!["start", "stop", "start"]);
    }

    #[test]
    fn governor_reacts_first_and_may_stop_child() {
        let a = atom(0);
        let (child, seen) = recorder(&a);

        let stopped = child.clone();
        let governor = Reaction::new(&a, move |v: &i32| {
            if *v > 1 {
                stopped.stop();
            }
            Ok(())
        });
        governor.adopt(&child).unwrap();

        child.start().unwrap();
        governor.start().unwrap();

        a.set(1).unwrap();
        a.set(2).unwrap();
        assert!(!child.is_active());
        assert_eq!(*seen.borrow(), vec![0, 1]);
    }

    #[test]
    fn adopt_rejects_second_governor_and_cycles() {
        let a = atom(0);
        let (parent, _) = recorder(&a);
        let (child, _) = recorder(&a);
        let (other, _) = recorder(&a);

        parent.adopt(&child).unwrap();
        assert!(matches!(other.adopt(&child), Err(Error::Misuse { .. })));
        assert!(child.adopt(&parent).unwrap_err().is_cycle());

        child.orphan();
        other.adopt(&child).unwrap();
        assert_eq!(child.governor(), Some(other.clone()));
    }

    #[test]
    fn write_to_own_source_is_a_cycle() {
        let a = atom(0);
        let target = a.clone();
        let r = Reaction::new(&a, move |v: &i32| target.set(v + 1));

        let err = r.start().unwrap_err();
        assert!(err.is_cycle());
        assert!(!r.is_reacting());
    }

    #[test]
    fn weak_handle_does_not_keep_reaction_alive() {
        let a = atom(0);
        let (r, _) = recorder(&a);
        let weak = r.downgrade();

        assert!(weak.upgrade().is_some());
        drop(r);
        assert!(weak.upgrade().is_none());
    }
}
