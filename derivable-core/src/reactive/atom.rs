//! Atom Implementation
//!
//! An atom is the mutable leaf of the graph. It holds a value and a
//! version, and it is the only kind of node that can be written.
//!
//! # How Atoms Work
//!
//! 1. Reading an atom inside a derivation records `(atom, version)` in the
//!    derivation's capture frame.
//!
//! 2. Writing a value equal to the visible one is a no-op. Any other write
//!    draws a fresh version and bumps the epoch.
//!
//! 3. Outside a transaction the write lands in the atom immediately and a
//!    notification sweep runs. Inside one it is held in the innermost
//!    transaction context until the outermost commit.
//!
//! # Memory Layout
//!
//! Each atom is one `Rc` allocation holding:
//! - A unique ID (8 bytes)
//! - A weak self-reference, used to hand out graph handles
//! - The root value and version behind a `RefCell`
//! - The equality policy

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::trace;

use super::context::ReactiveContext;
use super::derivable::{Derivable, Identified, Source};
use super::derivation::Derivation;
use super::equality::Equality;
use super::react::{self, ReactHandle, ReactOptions};
use super::runtime::Runtime;
use super::transaction::{self, Committable};
use crate::error::{Error, Result};
use crate::graph::{Node, NodeId, NodeKind, Version};

struct AtomState<T> {
    value: T,
    version: Version,
}

pub(crate) struct AtomCore<T: 'static> {
    id: NodeId,
    this: Weak<AtomCore<T>>,
    state: RefCell<AtomState<T>>,
    equality: Equality<T>,
}

impl<T: Clone + 'static> AtomCore<T> {
    fn new(value: T, equality: Equality<T>) -> Rc<Self> {
        let id = NodeId::new();
        let version = Runtime::next_version();
        trace!(node = %id, version, "atom created");

        Rc::new_cyclic(|this| Self {
            id,
            this: this.clone(),
            state: RefCell::new(AtomState { value, version }),
            equality,
        })
    }

    fn strong(&self) -> Rc<Self> {
        self.this.upgrade().expect("atom is alive while borrowed")
    }

    /// The value and version observers should see right now: the innermost
    /// pending write if a transaction holds one, otherwise the root.
    fn visible(&self) -> (T, Version) {
        transaction::pending_value::<T>(self.id).unwrap_or_else(|| {
            let state = self.state.borrow();
            (state.value.clone(), state.version)
        })
    }

    fn visible_version(&self) -> Version {
        transaction::pending_version(self.id).unwrap_or_else(|| self.state.borrow().version)
    }

    fn set(&self, value: T) -> Result<()> {
        if ReactiveContext::is_capturing() {
            return Err(Error::misuse(format!(
                "atom {} written while a derivation was being evaluated",
                self.id
            )));
        }

        let (current, _) = self.visible();
        if self.equality.eq(&current, &value) {
            return Ok(());
        }

        let version = Runtime::next_version();

        if transaction::in_transaction() {
            let target: Rc<dyn Committable> = self.strong();
            transaction::write_pending(self.id, Box::new(value), version, target);
            Runtime::bump_epoch();
            return Ok(());
        }

        {
            let mut state = self.state.borrow_mut();
            state.value = value;
            state.version = version;
        }
        Runtime::bump_epoch();
        trace!(node = %self.id, version, "atom set");

        Runtime::propagate(&[self.id])
    }
}

impl<T: Clone + 'static> Node for AtomCore<T> {
    fn id(&self) -> NodeId {
        self.id
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Atom
    }

    fn update(&self) -> Result<Version> {
        Ok(self.visible_version())
    }
}

impl<T: Clone + 'static> Source<T> for AtomCore<T> {
    fn current(&self) -> Result<(T, Version)> {
        Ok(self.visible())
    }

    fn equality(&self) -> Equality<T> {
        self.equality.clone()
    }

    fn as_node(&self) -> Rc<dyn Node> {
        self.strong()
    }
}

impl<T: Clone + 'static> Committable for AtomCore<T> {
    fn apply(&self, value: Box<dyn Any>, version: Version) -> bool {
        let Ok(value) = value.downcast::<T>() else {
            return false;
        };

        let mut state = self.state.borrow_mut();
        if self.equality.eq(&state.value, &value) {
            return false;
        }
        state.value = *value;
        state.version = version;
        trace!(node = %self.id, version, "atom committed");
        true
    }
}

/// A mutable reactive cell.
///
/// Cloning an `Atom` creates a new handle to the **same** cell.
///
/// # Example
///
/// ```rust
/// use derivable_core::reactive::atom;
///
/// let count = atom(0);
/// count.set(5)?;
/// assert_eq!(count.get(), 5);
/// # Ok::<(), derivable_core::Error>(())
/// ```
pub struct Atom<T: 'static> {
    core: Rc<AtomCore<T>>,
}

/// Create an atom compared with `PartialEq`.
pub fn atom<T: Clone + PartialEq + 'static>(value: T) -> Atom<T> {
    Atom::new(value)
}

impl<T: Clone + 'static> Atom<T> {
    pub fn new(value: T) -> Self
    where
        T: PartialEq,
    {
        Self::new_with_equality(value, Equality::partial_eq())
    }

    pub fn new_with_equality(value: T, equality: Equality<T>) -> Self {
        Self {
            core: AtomCore::new(value, equality),
        }
    }

    /// A new, independent atom holding this atom's current value but
    /// comparing with `equality`.
    pub fn with_equality(&self, equality: Equality<T>) -> Self {
        Self::new_with_equality(self.get_untracked(), equality)
    }

    pub fn id(&self) -> NodeId {
        self.core.id
    }

    /// The visible version, which changes on every accepted write.
    pub fn version(&self) -> Version {
        self.core.visible_version()
    }

    /// Read the value, recording a dependency when called inside a
    /// derivation.
    pub fn get(&self) -> T {
        let (value, version) = self.core.visible();
        ReactiveContext::record(&self.core.as_node(), version);
        value
    }

    pub fn get_untracked(&self) -> T {
        self.core.visible().0
    }

    /// Write a new value.
    ///
    /// Errors with [`Error::Misuse`] when called from inside a deriver, and
    /// passes through errors raised by reactions during the sweep.
    pub fn set(&self, value: T) -> Result<()> {
        self.core.set(value)
    }

    /// Write `f(current)`.
    pub fn update(&self, f: impl FnOnce(&T) -> T) -> Result<()> {
        let next = f(&self.get_untracked());
        self.set(next)
    }

    /// Write `value` and return the previous value.
    pub fn swap(&self, value: T) -> Result<T> {
        let previous = self.get_untracked();
        self.set(value)?;
        Ok(previous)
    }

    pub fn equality(&self) -> Equality<T> {
        self.core.equality.clone()
    }

    /// A type-erased read handle to this atom.
    pub fn derivable(&self) -> Derivable<T> {
        Derivable::from_source(self.core.clone())
    }

    /// Derive a new value from this atom.
    pub fn map<U>(&self, f: impl Fn(&T) -> U + 'static) -> Derivation<U>
    where
        U: Clone + PartialEq + 'static,
    {
        let atom = self.clone();
        Derivation::new(move || f(&atom.get()))
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

impl<T: 'static> Clone for Atom<T> {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
        }
    }
}

impl<T: 'static> Identified for Atom<T> {
    fn id(&self) -> NodeId {
        self.core.id
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Atom
    }
}

impl<T: Clone + 'static> From<Atom<T>> for Derivable<T> {
    fn from(atom: Atom<T>) -> Self {
        atom.derivable()
    }
}

impl<T: Clone + 'static> From<&Atom<T>> for Derivable<T> {
    fn from(atom: &Atom<T>) -> Self {
        atom.derivable()
    }
}

impl<T: Clone + fmt::Debug + 'static> fmt::Debug for Atom<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Atom")
            .field("id", &self.core.id)
            .field("value", &self.get_untracked())
            .field("version", &self.version())
            .finish()
    }
}
