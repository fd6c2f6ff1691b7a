//! Lenses
//!
//! A lens is a derivation that can also be written. Reading runs the
//! getter like any derivation. Writing runs the setter inside a
//! transaction, so a setter that touches several atoms is observed as a
//! single change.

use std::fmt;
use std::rc::Rc;

use super::atom::Atom;
use super::derivable::{Derivable, Identified, Source};
use super::derivation::{Derivation, DerivationCore};
use super::equality::Equality;
use super::react::{self, ReactHandle, ReactOptions};
use super::transaction::transact;
use crate::error::Result;
use crate::graph::{Node, NodeId, NodeKind, Version};

type Setter<T> = Rc<dyn Fn(T) -> Result<()>>;

/// A readable and writable view over other nodes.
///
/// # Example
///
/// ```rust
/// use derivable_core::reactive::atom;
///
/// let celsius = atom(100.0_f64);
/// let fahrenheit = celsius.proxy(|c| c * 9.0 / 5.0 + 32.0, |_, f| (f - 32.0) * 5.0 / 9.0);
///
/// assert_eq!(fahrenheit.get()?, 212.0);
/// fahrenheit.set(32.0)?;
/// assert_eq!(celsius.get(), 0.0);
/// # Ok::<(), derivable_core::Error>(())
/// ```
pub struct Lens<T: 'static> {
    core: Rc<DerivationCore<T>>,
    setter: Setter<T>,
}

/// Create a lens from a getter and a setter.
pub fn lens<T, G, S>(get: G, set: S) -> Lens<T>
where
    T: Clone + PartialEq + 'static,
    G: Fn() -> Result<T> + 'static,
    S: Fn(T) -> Result<()> + 'static,
{
    Lens::new_with_equality(Equality::partial_eq(), get, set)
}

impl<T: Clone + 'static> Lens<T> {
    pub fn new_with_equality(
        equality: Equality<T>,
        get: impl Fn() -> Result<T> + 'static,
        set: impl Fn(T) -> Result<()> + 'static,
    ) -> Self {
        Self {
            core: DerivationCore::new(NodeKind::Lens, Rc::new(get), equality),
            setter: Rc::new(set),
        }
    }

    /// A new lens with the same getter and setter but another equality.
    pub fn with_equality(&self, equality: Equality<T>) -> Self {
        Self {
            core: DerivationCore::new(NodeKind::Lens, Rc::clone(&self.core.deriver), equality),
            setter: Rc::clone(&self.setter),
        }
    }

    pub fn id(&self) -> NodeId {
        self.core.id()
    }

    pub fn get(&self) -> Result<T> {
        self.core.get()
    }

    pub fn get_untracked(&self) -> Result<T> {
        self.core.current().map(|(value, _)| value)
    }

    pub fn version(&self) -> Result<Version> {
        self.derivable().version()
    }

    /// Write through the setter, atomically.
    ///
    /// Joins an open transaction as a nested one. An error from the setter
    /// discards every write it made.
    pub fn set(&self, value: T) -> Result<()> {
        transact(|| (self.setter)(value)).map(|_| ())
    }

    /// Write `f(current)`.
    pub fn update(&self, f: impl FnOnce(&T) -> T) -> Result<()> {
        let next = f(&self.get_untracked()?);
        self.set(next)
    }

    pub fn derivable(&self) -> Derivable<T> {
        Derivable::from_source(self.core.clone())
    }

    /// A lens over this lens.
    pub fn proxy<U>(
        &self,
        get: impl Fn(&T) -> U + 'static,
        set: impl Fn(&T, U) -> T + 'static,
    ) -> Lens<U>
    where
        U: Clone + PartialEq + 'static,
    {
        let (reader, writer) = (self.clone(), self.clone());
        lens(
            move || reader.get().map(|value| get(&value)),
            move |next| {
                let current = writer.get_untracked()?;
                writer.set(set(&current, next))
            },
        )
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

impl<T: Clone + PartialEq + 'static> Atom<T> {
    /// A lens that reads `get(atom)` and writes `set(atom, value)` back.
    pub fn proxy<U>(
        &self,
        get: impl Fn(&T) -> U + 'static,
        set: impl Fn(&T, U) -> T + 'static,
    ) -> Lens<U>
    where
        U: Clone + PartialEq + 'static,
    {
        let (reader, writer) = (self.clone(), self.clone());
        lens(
            move || Ok(get(&reader.get())),
            move |next| writer.update(|current| set(current, next)),
        )
    }
}

impl<T: 'static> Clone for Lens<T> {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
            setter: Rc::clone(&self.setter),
        }
    }
}

impl<T: Clone + 'static> Identified for Lens<T> {
    fn id(&self) -> NodeId {
        self.core.id()
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Lens
    }
}

impl<T: Clone + 'static> From<Lens<T>> for Derivable<T> {
    fn from(lens: Lens<T>) -> Self {
        lens.derivable()
    }
}

impl<T: Clone + 'static> From<&Lens<T>> for Derivable<T> {
    fn from(lens: &Lens<T>) -> Self {
        lens.derivable()
    }
}

impl<T: Clone + 'static> fmt::Debug for Lens<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lens").field("id", &self.core.id()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::reactive::{atom, Transaction};
    use std::cell::RefCell;

    #[test]
    fn proxy_reads_and_writes_through() {
        let pair = atom((1, 2));
        let first = pair.proxy(|p| p.0, |p, v| (v, p.1));

        assert_eq!(first.get().unwrap(), 1);
        first.set(10).unwrap();
        assert_eq!(pair.get(), (10, 2));
        assert_eq!(first.get().unwrap(), 10);
    }

    #[test]
    fn setter_writes_are_one_change() {
        let a = atom(0);
        let b = atom(0);
        let both = lens(
            {
                let (a, b) = (a.clone(), b.clone());
                move || Ok((a.get(), b.get()))
            },
            {
                let (a, b) = (a.clone(), b.clone());
                move |(x, y)| {
                    a.set(x)?;
                    b.set(y)
                }
            },
        );

        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&seen);
        both.react(move |v: &(i32, i32)| {
            log.borrow_mut().push(*v);
            Ok(())
        })
        .unwrap();

        both.set((1, 1)).unwrap();
        assert_eq!(*seen.borrow(), vec![(0, 0), (1, 1)]);
    }

    #[test]
    fn failing_setter_discards_partial_writes() {
        let a = atom(0);
        let l = lens(
            {
                let a = a.clone();
                move || Ok(a.get())
            },
            {
                let a = a.clone();
                move |v| {
                    a.set(v)?;
                    Err(Error::misuse("rejected"))
                }
            },
        );

        assert!(l.set(5).is_err());
        assert_eq!(a.get(), 0);
    }

    #[test]
    fn set_inside_transaction_is_deferred() {
        let a = atom(1);
        let doubled = a.proxy(|v| v * 2, |_, v| v / 2);

        let mut txn = Transaction::begin();
        doubled.set(8).unwrap();
        assert_eq!(doubled.get().unwrap(), 8);
        txn.abort().unwrap();

        assert_eq!(a.get(), 1);
    }

    #[test]
    fn with_equality_shares_getter_and_setter() {
        let a = atom(10);
        let tens = a.proxy(|v| *v, |_, v| v);
        let coarse = tens.with_equality(Equality::new(|x: &i32, y: &i32| x / 10 == y / 10));
        assert_ne!(coarse.id(), tens.id());

        let seen = Rc::new(RefCell::new(Vec::new()));
        let handle = coarse
            .react({
                let seen = Rc::clone(&seen);
                move |v: &i32| {
                    seen.borrow_mut().push(*v);
                    Ok(())
                }
            })
            .unwrap();

        a.set(15).unwrap();
        coarse.set(23).unwrap();
        assert_eq!(a.get(), 23);
        assert_eq!(*seen.borrow(), vec![10, 23]);

        handle.stop();
    }

    #[test]
    fn nested_proxies() {
        let root = atom((1, (2, 3)));
        let inner = root.proxy(|r| r.1, |r, v| (r.0, v));
        let deep = inner.proxy(|i| i.1, |i, v| (i.0, v));

        deep.set(30).unwrap();
        assert_eq!(root.get(), (1, (2, 30)));
        assert_eq!(deep.get().unwrap(), 30);
    }
}
