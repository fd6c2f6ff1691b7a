//! Derivable Core
//!
//! This crate provides an incremental, pull-based dependency-tracking
//! engine. It implements:
//!
//! - Mutable atoms and cached derivations over them
//! - Reactions that run side effects when observed values change
//! - Nested transactions and a shared ticker for batching writes
//! - Lenses, which are writable derivations
//!
//! The runtime is thread-local and single-threaded. Handles are `!Send`.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: Reactive primitives, dependency capture and transactions
//! - `graph`: Node identity and the observation edges between nodes
//! - `error`: The crate's error type
//!
//! # Example
//!
//! ```rust
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use derivable_core::reactive::{atom, derive};
//!
//! // Create an atom
//! let count = atom(1);
//!
//! // Create a derived value
//! let doubled = derive({
//!     let count = count.clone();
//!     move || count.get() * 2
//! });
//!
//! // React to it
//! let seen = Rc::new(RefCell::new(Vec::new()));
//! let log = Rc::clone(&seen);
//! let handle = doubled.react(move |v: &i32| {
//!     log.borrow_mut().push(*v);
//!     Ok(())
//! })?;
//!
//! // Update the atom; the reaction runs with the new derived value
//! count.set(5)?;
//! assert_eq!(*seen.borrow(), vec![2, 10]);
//!
//! handle.stop();
//! # Ok::<(), derivable_core::Error>(())
//! ```

pub mod error;
pub mod graph;
pub mod reactive;

pub use error::{Error, Result};
