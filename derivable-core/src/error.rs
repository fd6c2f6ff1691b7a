//! Error Types
//!
//! Every failure in the engine surfaces synchronously at the call that
//! caused it. Nothing is retried and nothing is swallowed.

use thiserror::Error;

use crate::graph::NodeId;
use crate::reactive::TransactionState;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by atoms, derivations, reactions and transactions.
#[derive(Debug, Error)]
pub enum Error {
    /// A reaction (or derivation) was re-entered while it was still on
    /// the call stack.
    #[error("cycle detected: {reason}")]
    Cycle { reason: String },

    /// The API was used in a way it does not support.
    #[error("misuse: {message}")]
    Misuse { message: String },

    /// A transaction was committed or aborted outside the `Running` state.
    #[error("transaction {id} is {state:?}, expected it to be running and innermost")]
    TransactionState { id: u64, state: TransactionState },

    /// The abort signal. Returned from a `transact` body to discard it.
    #[error("transaction aborted")]
    Aborted,

    /// An error raised by a user-supplied deriver or callback.
    #[error(transparent)]
    User(Box<dyn std::error::Error + 'static>),
}

impl Error {
    #[must_use]
    pub fn cycle(reason: impl Into<String>) -> Self {
        Self::Cycle {
            reason: reason.into(),
        }
    }

    pub(crate) fn reaction_cycle(id: NodeId) -> Self {
        Self::cycle(format!("reaction {id} triggered itself while reacting"))
    }

    #[must_use]
    pub fn misuse(message: impl Into<String>) -> Self {
        Self::Misuse {
            message: message.into(),
        }
    }

    /// Wrap an error produced by user code.
    #[must_use]
    pub fn user(err: impl std::error::Error + 'static) -> Self {
        Self::User(Box::new(err))
    }

    pub fn is_cycle(&self) -> bool {
        matches!(self, Self::Cycle { .. })
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// Borrow the original user error, if this is one of type `E`.
    pub fn downcast_user_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match self {
            Self::User(err) => err.downcast_ref::<E>(),
            _ => None,
        }
    }
}

impl From<Box<dyn std::error::Error + 'static>> for Error {
    fn from(err: Box<dyn std::error::Error + 'static>) -> Self {
        Self::User(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error, PartialEq)]
    #[error("boom {0}")]
    struct Boom(u32);

    #[test]
    fn user_errors_keep_their_type() {
        let err = Error::user(Boom(7));
        assert_eq!(err.to_string(), "boom 7");
        assert_eq!(err.downcast_user_ref::<Boom>(), Some(&Boom(7)));
        assert!(err.downcast_user_ref::<std::fmt::Error>().is_none());
    }

    #[test]
    fn predicates() {
        assert!(Error::cycle("x").is_cycle());
        assert!(Error::Aborted.is_aborted());
        assert!(!Error::misuse("x").is_cycle());
    }
}
