//! Equality Policy
//!
//! Every "did this value actually change" decision in the engine goes
//! through an [`Equality`]. Atoms use it to ignore no-op writes,
//! derivations use it to absorb recomputes that produce the same value,
//! and reactions use it to skip callbacks.

use std::fmt;
use std::rc::Rc;

/// A pluggable `(a, b) -> bool` equality predicate.
pub struct Equality<T> {
    eq: Rc<dyn Fn(&T, &T) -> bool>,
}

impl<T: 'static> Equality<T> {
    /// Build a policy from an arbitrary predicate.
    pub fn new(eq: impl Fn(&T, &T) -> bool + 'static) -> Self {
        Self { eq: Rc::new(eq) }
    }

    /// Structural equality via `PartialEq`. This is the default.
    pub fn partial_eq() -> Self
    where
        T: PartialEq,
    {
        Self::new(|a: &T, b: &T| a == b)
    }

    /// Treat every value as different from every other value.
    pub fn never() -> Self {
        Self::new(|_, _| false)
    }

    /// Compare two values.
    #[inline]
    pub fn eq(&self, a: &T, b: &T) -> bool {
        (self.eq)(a, b)
    }
}

impl<T> Clone for Equality<T> {
    fn clone(&self) -> Self {
        Self {
            eq: Rc::clone(&self.eq),
        }
    }
}

impl<T: PartialEq + 'static> Default for Equality<T> {
    fn default() -> Self {
        Self::partial_eq()
    }
}

impl<T> fmt::Debug for Equality<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Equality")
    }
}
