//! Transactions
//!
//! A transaction batches atom writes so that observers see them all at
//! once, or not at all.
//!
//! # How Transactions Work
//!
//! 1. Beginning a transaction pushes a context onto a thread-local stack.
//!
//! 2. While a context is open, `Atom::set` stores the new value in the
//!    innermost context instead of the atom. Reads walk the stack from the
//!    innermost context outwards, so code inside a transaction sees its own
//!    writes and its ancestors' writes.
//!
//! 3. Committing a nested transaction folds its writes into the parent.
//!    Committing the outermost one applies every write to the atoms, bumps
//!    the epoch once and runs a single notification sweep over the union of
//!    affected reactions.
//!
//! 4. Aborting discards the context. Derivations read inside it may have
//!    rewired their edges for the discarded values, so the outermost
//!    abort or commit sweeps every atom the transaction touched. Reactions
//!    only fire if their value really moved.
//!
//! Contexts form a stack, so a sibling transaction's writes have already
//! been folded or discarded by the time the next sibling begins.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};
use tracing::{debug, error, trace};

use super::runtime::Runtime;
use crate::error::{Error, Result};
use crate::graph::{NodeId, Version};

thread_local! {
    static TRANSACTIONS: RefCell<Vec<TransactionContext>> = const { RefCell::new(Vec::new()) };
    static NEXT_TRANSACTION_ID: Cell<u64> = const { Cell::new(1) };
    static TICKER: RefCell<Option<TickerState>> = const { RefCell::new(None) };
}

/// Lifecycle of a [`Transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Running,
    Committed,
    Aborted,
}

/// A node whose writes can be held back by a transaction.
pub(crate) trait Committable {
    /// Install a committed value as root state.
    ///
    /// Returns `false` when the value equals the current root value, in
    /// which case the root is left untouched.
    fn apply(&self, value: Box<dyn Any>, version: Version) -> bool;
}

struct PendingWrite {
    value: Box<dyn Any>,
    version: Version,
    target: Rc<dyn Committable>,
}

struct TransactionContext {
    id: u64,
    pending: IndexMap<NodeId, PendingWrite>,
    /// Atoms written in nested contexts that were aborted.
    discarded: IndexSet<NodeId>,
}

impl TransactionContext {
    /// Every atom written in this context or a discarded child.
    fn touched(&self) -> Vec<NodeId> {
        self.pending
            .keys()
            .chain(self.discarded.iter())
            .copied()
            .collect::<IndexSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Whether `id` names the innermost open context.
fn is_innermost(id: u64) -> bool {
    TRANSACTIONS.with(|stack| stack.borrow().last().is_some_and(|ctx| ctx.id == id))
}

/// Whether a transaction is open on this thread.
pub fn in_transaction() -> bool {
    TRANSACTIONS.with(|stack| !stack.borrow().is_empty())
}

fn depth() -> usize {
    TRANSACTIONS.with(|stack| stack.borrow().len())
}

/// Look up the pending value for `node`, innermost context first.
pub(crate) fn pending_value<T: Clone + 'static>(node: NodeId) -> Option<(T, Version)> {
    TRANSACTIONS.with(|stack| {
        stack.borrow().iter().rev().find_map(|ctx| {
            let write = ctx.pending.get(&node)?;
            let value = write.value.downcast_ref::<T>()?;
            Some((value.clone(), write.version))
        })
    })
}

/// Version of the pending write for `node`, innermost context first.
pub(crate) fn pending_version(node: NodeId) -> Option<Version> {
    TRANSACTIONS.with(|stack| {
        stack
            .borrow()
            .iter()
            .rev()
            .find_map(|ctx| ctx.pending.get(&node).map(|write| write.version))
    })
}

/// Store a write in the innermost context.
///
/// Returns `false` when no transaction is open.
pub(crate) fn write_pending(
    node: NodeId,
    value: Box<dyn Any>,
    version: Version,
    target: Rc<dyn Committable>,
) -> bool {
    TRANSACTIONS.with(|stack| {
        let mut stack = stack.borrow_mut();
        let Some(ctx) = stack.last_mut() else {
            return false;
        };
        trace!(node = %node, version, transaction = ctx.id, "write held in transaction");
        ctx.pending.insert(
            node,
            PendingWrite {
                value,
                version,
                target,
            },
        );
        true
    })
}

/// An explicitly driven transaction.
///
/// Dropping a transaction that is still running aborts it, so a panic
/// inside a batch never leaks half-applied writes.
#[derive(Debug)]
pub struct Transaction {
    id: u64,
    state: TransactionState,
}

impl Transaction {
    /// Open a new transaction nested inside the current one, if any.
    #[must_use = "dropping a transaction aborts it"]
    pub fn begin() -> Self {
        let id = NEXT_TRANSACTION_ID.with(|next| {
            let id = next.get();
            next.set(id + 1);
            id
        });

        let depth = TRANSACTIONS.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.push(TransactionContext {
                id,
                pending: IndexMap::new(),
                discarded: IndexSet::new(),
            });
            stack.len()
        });
        debug!(transaction = id, depth, "transaction started");

        Self {
            id,
            state: TransactionState::Running,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == TransactionState::Running
    }

    /// Pop this transaction's context, which must be the innermost one.
    fn pop(&self) -> Result<TransactionContext> {
        let invalid = || Error::TransactionState {
            id: self.id,
            state: self.state,
        };

        if !self.is_running() {
            return Err(invalid());
        }

        TRANSACTIONS.with(|stack| {
            let mut stack = stack.borrow_mut();
            match stack.last() {
                Some(ctx) if ctx.id == self.id => stack.pop().ok_or_else(invalid),
                _ => Err(invalid()),
            }
        })
    }

    /// Commit this transaction.
    ///
    /// Nested transactions fold their writes into the parent. The
    /// outermost transaction applies them and notifies observers once.
    pub fn commit(&mut self) -> Result<()> {
        let ctx = self.pop()?;
        self.state = TransactionState::Committed;

        let outermost = TRANSACTIONS.with(|stack| {
            let mut stack = stack.borrow_mut();
            match stack.last_mut() {
                Some(parent) => {
                    debug!(
                        transaction = self.id,
                        parent = parent.id,
                        writes = ctx.pending.len(),
                        "transaction folded into parent"
                    );
                    for (node, write) in ctx.pending {
                        parent.pending.insert(node, write);
                    }
                    parent.discarded.extend(ctx.discarded);
                    None
                }
                None => Some(ctx),
            }
        });

        let Some(ctx) = outermost else {
            return Ok(());
        };

        // Writes that settle equal to the root still need a sweep, to
        // restore edges rewired while the pending value was visible.
        let touched = ctx.touched();
        let mut changed = 0;
        for (_, write) in ctx.pending {
            if write.target.apply(write.value, write.version) {
                changed += 1;
            }
        }
        Runtime::bump_epoch();
        debug!(
            transaction = self.id,
            changed,
            touched = touched.len(),
            "transaction committed"
        );

        Runtime::propagate(&touched)
    }

    /// Abort this transaction, discarding its writes.
    pub fn abort(&mut self) -> Result<()> {
        self.discard(true)
    }

    fn discard(&mut self, sweep: bool) -> Result<()> {
        let ctx = self.pop()?;
        self.state = TransactionState::Aborted;
        Runtime::bump_epoch();
        debug!(
            transaction = self.id,
            discarded = ctx.pending.len(),
            depth = depth(),
            "transaction aborted"
        );

        let touched = ctx.touched();
        let outermost = TRANSACTIONS.with(|stack| match stack.borrow_mut().last_mut() {
            Some(parent) => {
                parent.discarded.extend(touched.iter().copied());
                None
            }
            None => Some(touched),
        });

        match outermost {
            Some(touched) if sweep => Runtime::propagate(&touched),
            _ => Ok(()),
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.is_running() {
            // No user callbacks while unwinding.
            if let Err(err) = self.discard(!std::thread::panicking()) {
                error!(transaction = self.id, %err, "failed to abort dropped transaction");
            }
        }
    }
}

/// Run `f` inside a new transaction.
///
/// Returns `Ok(Some(_))` when `f` succeeded and the transaction committed,
/// and `Ok(None)` when `f` returned [`Error::Aborted`]. Any other error
/// aborts the transaction and is passed through.
pub fn transact<R>(f: impl FnOnce() -> Result<R>) -> Result<Option<R>> {
    let mut txn = Transaction::begin();
    match f() {
        Ok(value) => {
            txn.commit()?;
            Ok(Some(value))
        }
        Err(Error::Aborted) => {
            txn.abort()?;
            Ok(None)
        }
        Err(err) => {
            txn.abort()?;
            Err(err)
        }
    }
}

/// Wrap `f` so that every call runs in its own transaction.
pub fn transaction<A, R>(f: impl Fn(A) -> Result<R>) -> impl Fn(A) -> Result<Option<R>> {
    move |arg| transact(|| f(arg))
}

/// Run `f` in the current transaction, or in a new one if none is open.
///
/// Inside an open transaction an abort from `f` propagates to the
/// enclosing `transact`.
pub fn atomically<R>(f: impl FnOnce() -> Result<R>) -> Result<Option<R>> {
    if in_transaction() {
        f().map(Some)
    } else {
        transact(f)
    }
}

/// Wrap `f` so that every call runs through [`atomically`].
pub fn atomic<A, R>(f: impl Fn(A) -> Result<R>) -> impl Fn(A) -> Result<Option<R>> {
    move |arg| atomically(|| f(arg))
}

struct TickerState {
    refs: usize,
    txn: Option<Transaction>,
}

/// A shared, manually driven transaction.
///
/// All tickers on a thread share one transaction. Writes accumulate in it
/// until some ticker calls [`Ticker::tick`], which commits the batch and
/// opens the next one. The transaction is committed for good when the last
/// ticker is released.
#[derive(Debug)]
pub struct Ticker {
    released: bool,
}

/// Acquire a reference to the shared ticker transaction.
#[must_use = "dropping a ticker releases it"]
pub fn ticker() -> Ticker {
    TICKER.with(|cell| {
        let mut cell = cell.borrow_mut();
        match cell.as_mut() {
            Some(state) => state.refs += 1,
            None => {
                *cell = Some(TickerState {
                    refs: 1,
                    txn: Some(Transaction::begin()),
                });
            }
        }
    });

    Ticker { released: false }
}

fn take_ticker_txn() -> Result<Transaction> {
    TICKER
        .with(|cell| cell.borrow_mut().as_mut().and_then(|state| state.txn.take()))
        .ok_or_else(|| Error::misuse("ticker transaction is already being flushed"))
}

fn put_ticker_txn(txn: Transaction) {
    TICKER.with(|cell| {
        if let Some(state) = cell.borrow_mut().as_mut() {
            state.txn = Some(txn);
        }
    });
}

impl Ticker {
    fn ensure_live(&self) -> Result<()> {
        if self.released {
            return Err(Error::misuse("ticker used after release"));
        }
        Ok(())
    }

    /// Commit the pending batch and immediately open a new one.
    pub fn tick(&self) -> Result<()> {
        self.ensure_live()?;
        let mut txn = take_ticker_txn()?;

        let result = txn.commit();
        if txn.is_running() {
            put_ticker_txn(txn);
            return result;
        }

        put_ticker_txn(Transaction::begin());
        debug!("ticker ticked");
        result
    }

    /// Discard the pending batch and open a new one.
    pub fn reset(&self) -> Result<()> {
        self.ensure_live()?;
        let mut txn = take_ticker_txn()?;

        let result = txn.abort();
        if txn.is_running() {
            put_ticker_txn(txn);
            return result;
        }

        put_ticker_txn(Transaction::begin());
        result
    }

    /// Drop this reference. The last release commits the batch.
    ///
    /// Fails without releasing anything if the last release would have to
    /// commit while a transaction opened after the ticker is still running.
    pub fn release(&mut self) -> Result<()> {
        self.ensure_live()?;

        let blocked = TICKER.with(|cell| {
            let cell = cell.borrow();
            let state = cell.as_ref()?;
            let txn = state.txn.as_ref()?;
            (state.refs == 1 && !is_innermost(txn.id)).then(|| Error::TransactionState {
                id: txn.id,
                state: txn.state,
            })
        });
        if let Some(err) = blocked {
            return Err(err);
        }
        self.released = true;

        let last = TICKER.with(|cell| {
            let mut cell = cell.borrow_mut();
            let state = cell.as_mut()?;
            state.refs -= 1;
            if state.refs == 0 {
                cell.take()
            } else {
                None
            }
        });

        match last.and_then(|state| state.txn) {
            Some(mut txn) => {
                debug!("last ticker released");
                txn.commit()
            }
            None => Ok(()),
        }
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        if !self.released {
            if let Err(err) = self.release() {
                error!(%err, "failed to release dropped ticker");
            }
        }
    }
}
