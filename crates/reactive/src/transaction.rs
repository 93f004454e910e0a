//! Optimistic transactions.
//!
//! Every local mutation call creates a `Transaction`. Its mutations are
//! overlaid on the committed state of the collection while it is pending.
//! The collection's mutation handler returns a `Completion`; when it resolves
//! the transaction settles and its values become committed, when it rejects
//! the transaction rolls back and its overlay disappears.

use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::Cell;
use rill_core::{Completion, Error, Key, Value};

/// Unique identifier of a transaction, increasing in creation order.
pub type TransactionId = u64;

/// Lifecycle of a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionState {
    /// Waiting for the handler's confirmation; the overlay is active.
    Pending,
    /// Confirmed by the handler.
    Settled,
    /// Rejected by the handler; the overlay was removed.
    RolledBack,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationKind {
    Insert,
    Update,
    Delete,
}

/// One mutated key inside a transaction.
#[derive(Clone, Debug, PartialEq)]
pub struct Mutation {
    pub kind: MutationKind,
    pub key: Key,
    /// Visible value before the mutation (`None` for inserts).
    pub original: Option<Value>,
    /// Value after the mutation (`None` for deletes).
    pub modified: Option<Value>,
}

impl Mutation {
    pub fn insert(key: Key, value: Value) -> Self {
        Self {
            kind: MutationKind::Insert,
            key,
            original: None,
            modified: Some(value),
        }
    }

    pub fn update(key: Key, original: Value, modified: Value) -> Self {
        Self {
            kind: MutationKind::Update,
            key,
            original: Some(original),
            modified: Some(modified),
        }
    }

    pub fn delete(key: Key, original: Value) -> Self {
        Self {
            kind: MutationKind::Delete,
            key,
            original: Some(original),
            modified: None,
        }
    }
}

struct Inner {
    id: TransactionId,
    collection: String,
    mutations: Vec<Mutation>,
    state: Cell<TransactionState>,
    completion: Completion,
}

/// Shared handle to an optimistic transaction.
#[derive(Clone)]
pub struct Transaction {
    inner: Rc<Inner>,
}

/// Handler persisting a transaction. The returned completion confirms it.
pub type MutationFn = Rc<dyn Fn(&Transaction) -> Completion>;

impl Transaction {
    pub(crate) fn new(id: TransactionId, collection: impl Into<String>, mutations: Vec<Mutation>) -> Self {
        Self {
            inner: Rc::new(Inner {
                id,
                collection: collection.into(),
                mutations,
                state: Cell::new(TransactionState::Pending),
                completion: Completion::new(),
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> TransactionId {
        self.inner.id
    }

    /// Id of the collection the transaction mutates.
    pub fn collection_id(&self) -> &str {
        &self.inner.collection
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.inner.mutations
    }

    #[inline]
    pub fn state(&self) -> TransactionState {
        self.inner.state.get()
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.state() == TransactionState::Pending
    }

    /// Resolves when the transaction settles, rejects when it rolls back.
    pub fn completion(&self) -> Completion {
        self.inner.completion.clone()
    }

    /// Returns true if both handles refer to the same transaction.
    pub fn ptr_eq(&self, other: &Transaction) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Marks the transaction settled. Returns false if it was not pending.
    pub(crate) fn settle(&self) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.inner.state.set(TransactionState::Settled);
        self.inner.completion.resolve();
        true
    }

    /// Marks the transaction rolled back. Returns false if it was not pending.
    pub(crate) fn roll_back(&self, error: Error) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.inner.state.set(TransactionState::RolledBack);
        self.inner.completion.reject(error);
        true
    }
}

impl core::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id())
            .field("collection", &self.collection_id())
            .field("state", &self.state())
            .field("mutations", &self.mutations().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use rill_core::CompletionState;

    #[test]
    fn test_settle_once() {
        let tx = Transaction::new(1, "todos", vec![Mutation::insert(Key::Int(1), Value::Int64(1))]);
        assert!(tx.is_pending());
        assert!(tx.settle());
        assert!(!tx.settle());
        assert!(!tx.roll_back(Error::invalid_operation("late")));
        assert_eq!(tx.state(), TransactionState::Settled);
        assert!(tx.completion().is_resolved());
    }

    #[test]
    fn test_roll_back_rejects_completion() {
        let tx = Transaction::new(2, "todos", vec![]);
        let err = Error::invalid_operation("server said no");
        assert!(tx.roll_back(err.clone()));
        assert_eq!(tx.state(), TransactionState::RolledBack);
        assert_eq!(tx.completion().state(), CompletionState::Rejected(err));
    }
}
