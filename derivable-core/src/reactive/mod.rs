//! Reactive Primitives
//!
//! This module implements the core reactive system: atoms, derivations,
//! reactions and lenses, plus the transactions that batch writes to them.
//!
//! # Concepts
//!
//! ## Atoms
//!
//! An Atom is a container for mutable state. Reading an atom inside a
//! derivation records it as a parent of that derivation. Writing an atom
//! gives it a new version and wakes the reactions that can observe it.
//!
//! ## Derivations
//!
//! A Derivation is a cached value computed from other nodes. It is lazy:
//! it re-evaluates only when read, and only if a parent it read last time
//! has moved. A recompute that produces an equal value does not count as a
//! change.
//!
//! ## Reactions
//!
//! A Reaction runs a side effect with the value of a source whenever that
//! value changes. Reactions are what pull derivations up to date after a
//! write. [`react`] builds governed reactions with `from`, `when` and
//! `until` conditions.
//!
//! ## Lenses
//!
//! A Lens is a derivation with a setter. Writing a lens runs the setter in
//! a transaction.
//!
//! ## Transactions
//!
//! Writes made inside a transaction are invisible outside it until the
//! outermost transaction commits. Then every affected reaction runs once.
//!
//! # Implementation Notes
//!
//! The reactive system uses a thread-local capture stack to detect
//! dependencies automatically. When a node is read, we check whether a
//! derivation is being evaluated and, if so, record the read.
//!
//! Observation edges are only kept below active reactions. A derivation
//! that nothing observes holds no edges and can be dropped like any other
//! value.

mod atom;
mod context;
mod derivable;
mod derivation;
mod equality;
mod lens;
mod react;
mod reaction;
mod runtime;
mod transaction;

pub use atom::{atom, Atom};
pub use context::{capture, is_capturing, untracked};
pub use derivable::{
    is_atom, is_derivable, is_derivation, is_lens, is_reaction, map, Derivable, Identified,
};
pub use derivation::{derive, derive_with, try_derive, Derivation, Validity};
pub use equality::Equality;
pub use lens::{lens, Lens};
pub use react::{react, Condition, ReactHandle, ReactOptions};
pub use reaction::{Reaction, WeakReaction};
pub use runtime::Runtime;
pub use transaction::{
    atomic, atomically, in_transaction, ticker, transact, transaction, Ticker, Transaction,
    TransactionState,
};
