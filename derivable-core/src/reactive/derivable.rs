//! Derivable Handles
//!
//! [`Derivable<T>`] is the read side shared by atoms, derivations and
//! lenses. Anything that accepts "a value that may change over time", such
//! as a reaction source or a `when` condition, takes a `Derivable`.

use std::fmt;
use std::rc::Rc;

use super::context::ReactiveContext;
use super::derivation::Derivation;
use super::equality::Equality;
use super::react::{self, ReactHandle, ReactOptions};
use crate::error::Result;
use crate::graph::{Node, NodeId, NodeKind, Version};

/// A readable node producing values of type `T`.
pub(crate) trait Source<T>: Node {
    /// Bring the node up to date and return its value and version,
    /// without recording a dependency.
    fn current(&self) -> Result<(T, Version)>;

    fn equality(&self) -> Equality<T>;

    /// This node as a graph node.
    fn as_node(&self) -> Rc<dyn Node>;
}

/// Identity and variant tag of any node handle.
pub trait Identified {
    fn id(&self) -> NodeId;

    fn kind(&self) -> NodeKind;
}

pub fn is_atom(node: &impl Identified) -> bool {
    node.kind() == NodeKind::Atom
}

/// Lenses are derivations too.
pub fn is_derivation(node: &impl Identified) -> bool {
    matches!(node.kind(), NodeKind::Derivation | NodeKind::Lens)
}

pub fn is_lens(node: &impl Identified) -> bool {
    node.kind() == NodeKind::Lens
}

pub fn is_reaction(node: &impl Identified) -> bool {
    node.kind() == NodeKind::Reaction
}

pub fn is_derivable(node: &impl Identified) -> bool {
    node.kind().is_derivable()
}

/// Derive `f(source)` from any atom, derivation or lens.
pub fn map<T, U, S>(f: impl Fn(&T) -> U + 'static, source: S) -> Derivation<U>
where
    T: Clone + 'static,
    U: Clone + PartialEq + 'static,
    S: Into<Derivable<T>>,
{
    source.into().map(f)
}

/// A type-erased, read-only handle to an atom, derivation or lens.
///
/// Cloning a `Derivable` creates a new handle to the **same** node.
pub struct Derivable<T: 'static> {
    source: Rc<dyn Source<T>>,
}

impl<T: 'static> Clone for Derivable<T> {
    fn clone(&self) -> Self {
        Self {
            source: Rc::clone(&self.source),
        }
    }
}

impl<T: Clone + 'static> Derivable<T> {
    pub(crate) fn from_source(source: Rc<dyn Source<T>>) -> Self {
        Self { source }
    }

    /// Read the current value, recording a dependency if called while a
    /// derivation is being evaluated.
    pub fn get(&self) -> Result<T> {
        let (value, version) = self.source.current()?;
        ReactiveContext::record(&self.source.as_node(), version);
        Ok(value)
    }

    /// Read the current value without recording a dependency.
    pub fn get_untracked(&self) -> Result<T> {
        self.source.current().map(|(value, _)| value)
    }

    /// The node's current version, after bringing it up to date.
    pub fn version(&self) -> Result<Version> {
        self.source.update()
    }

    pub(crate) fn current(&self) -> Result<(T, Version)> {
        self.source.current()
    }

    pub(crate) fn node(&self) -> Rc<dyn Node> {
        self.source.as_node()
    }

    pub fn equality(&self) -> Equality<T> {
        self.source.equality()
    }

    /// Derive a new value from this one.
    pub fn map<U>(&self, f: impl Fn(&T) -> U + 'static) -> Derivation<U>
    where
        U: Clone + PartialEq + 'static,
    {
        let source = self.clone();
        Derivation::try_new(move || source.get().map(|value| f(&value)))
    }

    /// Start a reaction with default options.
    pub fn react(&self, callback: impl FnMut(&T) -> Result<()> + 'static) -> Result<ReactHandle> {
        react::react(self.clone(), callback, ReactOptions::default())
    }

    /// Start a governed reaction.
    pub fn react_with(
        &self,
        callback: impl FnMut(&T) -> Result<()> + 'static,
        options: ReactOptions,
    ) -> Result<ReactHandle> {
        react::react(self.clone(), callback, options)
    }
}

impl<T: 'static> Identified for Derivable<T> {
    fn id(&self) -> NodeId {
        self.source.id()
    }

    fn kind(&self) -> NodeKind {
        self.source.kind()
    }
}

impl<T: 'static> fmt::Debug for Derivable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Derivable")
            .field("id", &self.source.id())
            .field("kind", &self.source.kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{atom, derive, lens, Atom};

    #[test]
    fn predicates_follow_the_node_tag() {
        let a = atom(1);
        let d = derive({
            let a = a.clone();
            move || a.get() + 1
        });
        let l = lens(
            {
                let a = a.clone();
                move || Ok(a.get())
            },
            {
                let a = a.clone();
                move |v| a.set(v)
            },
        );

        assert!(is_atom(&a) && is_derivable(&a) && !is_derivation(&a));
        assert!(is_derivation(&d) && !is_lens(&d));
        assert!(is_derivation(&l) && is_lens(&l));
        assert!(is_atom(&Derivable::from(&a)));
    }

    #[test]
    fn erased_handles_read_through() {
        let a: Atom<i32> = atom(2);
        let erased: Derivable<i32> = a.clone().into();
        let squared = erased.map(|v| v * v);
        let label = map(|v: &i32| format!("#{v}"), &squared);

        assert_eq!(erased.get().unwrap(), 2);
        assert_eq!(squared.get().unwrap(), 4);

        a.set(3).unwrap();
        assert_eq!(squared.get().unwrap(), 9);
        assert_eq!(label.get().unwrap(), "#9");
        assert_eq!(erased.id(), a.id());
    }
}
