//! Collections.
//!
//! A `Collection` holds the rows a source synced into it, overlays the
//! pending optimistic transactions created by local mutations, and notifies
//! its subscriptions with one `ChangeSet` per state transition.
//!
//! The handle is a cheap clone over shared state. User callbacks (mutation
//! handlers, subscription callbacks, status listeners) always run after the
//! shared state has been released, so they may call back into the collection.
//!
//! # Example
//!
//! ```ignore
//! use rill_core::{Completion, Key, Value};
//! use rill_reactive::{Collection, CollectionConfig, SubscribeOptions};
//!
//! let todos = Collection::new(
//!     CollectionConfig::new("todos", |v: &Value| Key::from_value(v.get_field("id").unwrap()).unwrap())
//!         .on_insert(|_tx| Completion::resolved()),
//! );
//! let _sub = todos.subscribe_changes(|changes| { /* ... */ }, SubscribeOptions::new())?;
//! todos.insert(Value::object([("id", Value::Int64(1)), ("title", Value::from("write docs"))]))?;
//! ```

mod state;
mod sync;

pub use sync::{RowUpdateMode, SyncHandle, SyncOperation, SyncSource};

use crate::change_set::ChangeSet;
use crate::subscription::{ChangeCallback, CollectionSubscription, SubscribeOptions, SubscriptionManager};
use crate::transaction::{Mutation, MutationFn, Transaction, TransactionId};
use alloc::rc::{Rc, Weak};
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::fmt;
use hashbrown::{HashMap, HashSet};
use rill_core::{debug_log, Completion, CompletionState, Error, Key, Result, Value};
use rill_query::{DeduplicatedLoadSubset, LoadSubsetOptions, LoadSubsetResult};
use state::CollectionState;

/// Extracts the key of a row.
pub type KeyFn = Rc<dyn Fn(&Value) -> Key>;

/// Callback notified on status transitions.
pub type StatusListener = Rc<dyn Fn(CollectionStatus)>;

/// Lifecycle of a collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CollectionStatus {
    /// Created, sync not started.
    Idle,
    /// Sync started, initial data not complete.
    Loading,
    /// The source marked the initial data complete.
    Ready,
    /// The source failed. Visible data is kept.
    Error,
    /// Cleaned up; the source was released.
    CleanedUp,
}

impl CollectionStatus {
    /// Returns true if moving from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: CollectionStatus) -> bool {
        use CollectionStatus::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Idle, Loading | Error | CleanedUp)
                | (Loading, Ready | Error | CleanedUp)
                | (Ready, Error | CleanedUp)
                | (Error, Idle | CleanedUp)
                | (CleanedUp, Loading | Error)
        )
    }
}

impl fmt::Display for CollectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CollectionStatus::Idle => "idle",
            CollectionStatus::Loading => "loading",
            CollectionStatus::Ready => "ready",
            CollectionStatus::Error => "error",
            CollectionStatus::CleanedUp => "cleaned-up",
        };
        f.write_str(s)
    }
}

/// Builder for a collection.
pub struct CollectionConfig {
    id: String,
    get_key: KeyFn,
    source: Option<Rc<dyn SyncSource>>,
    on_insert: Option<MutationFn>,
    on_update: Option<MutationFn>,
    on_delete: Option<MutationFn>,
    row_update_mode: RowUpdateMode,
    start_sync: bool,
}

impl CollectionConfig {
    pub fn new<F>(id: impl Into<String>, get_key: F) -> Self
    where
        F: Fn(&Value) -> Key + 'static,
    {
        Self {
            id: id.into(),
            get_key: Rc::new(get_key),
            source: None,
            on_insert: None,
            on_update: None,
            on_delete: None,
            row_update_mode: RowUpdateMode::default(),
            start_sync: false,
        }
    }

    /// Sets the source feeding the collection.
    pub fn sync<S: SyncSource + 'static>(mut self, source: S) -> Self {
        self.source = Some(Rc::new(source));
        self
    }

    /// Sets an already shared source.
    pub fn sync_shared(mut self, source: Rc<dyn SyncSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn on_insert<F: Fn(&Transaction) -> Completion + 'static>(mut self, f: F) -> Self {
        self.on_insert = Some(Rc::new(f));
        self
    }

    pub fn on_update<F: Fn(&Transaction) -> Completion + 'static>(mut self, f: F) -> Self {
        self.on_update = Some(Rc::new(f));
        self
    }

    pub fn on_delete<F: Fn(&Transaction) -> Completion + 'static>(mut self, f: F) -> Self {
        self.on_delete = Some(Rc::new(f));
        self
    }

    pub fn row_update_mode(mut self, mode: RowUpdateMode) -> Self {
        self.row_update_mode = mode;
        self
    }

    /// Starts syncing as soon as the collection is created.
    pub fn start_sync(mut self, start: bool) -> Self {
        self.start_sync = start;
        self
    }
}

pub(crate) struct CollectionInner {
    id: String,
    get_key: KeyFn,
    state: CollectionState,
    status: CollectionStatus,
    error: Option<Error>,
    source: Option<Rc<dyn SyncSource>>,
    loader: Option<DeduplicatedLoadSubset>,
    on_insert: Option<MutationFn>,
    on_update: Option<MutationFn>,
    on_delete: Option<MutationFn>,
    next_transaction_id: TransactionId,
    subscriptions: SubscriptionManager,
    status_listeners: HashMap<u64, StatusListener>,
    next_listener_id: u64,
    ready_waiters: Vec<Completion>,
}

impl CollectionInner {
    fn ensure_usable(&self) -> Result<()> {
        match self.status {
            CollectionStatus::Error | CollectionStatus::CleanedUp => {
                Err(Error::collection_in_error_state(self.id.clone()))
            }
            _ => Ok(()),
        }
    }

    fn new_transaction(&mut self, mutations: Vec<Mutation>) -> Transaction {
        let id = self.next_transaction_id;
        self.next_transaction_id += 1;
        Transaction::new(id, self.id.clone(), mutations)
    }
}

/// Shared handle to a collection.
#[derive(Clone)]
pub struct Collection {
    pub(crate) inner: Rc<RefCell<CollectionInner>>,
}

impl Collection {
    pub fn new(config: CollectionConfig) -> Self {
        let start = config.start_sync;
        let collection = Self {
            inner: Rc::new(RefCell::new(CollectionInner {
                id: config.id,
                get_key: config.get_key,
                state: CollectionState::new(config.row_update_mode),
                status: CollectionStatus::Idle,
                error: None,
                source: config.source,
                loader: None,
                on_insert: config.on_insert,
                on_update: config.on_update,
                on_delete: config.on_delete,
                next_transaction_id: 1,
                subscriptions: SubscriptionManager::new(),
                status_listeners: HashMap::new(),
                next_listener_id: 1,
                ready_waiters: Vec::new(),
            })),
        };
        if start {
            collection.start_sync();
        }
        collection
    }

    pub(crate) fn from_weak(weak: &Weak<RefCell<CollectionInner>>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub(crate) fn downgrade(&self) -> Weak<RefCell<CollectionInner>> {
        Rc::downgrade(&self.inner)
    }

    /// Returns true if both handles refer to the same collection.
    pub fn ptr_eq(&self, other: &Collection) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn id(&self) -> String {
        self.inner.borrow().id.clone()
    }

    pub fn key_of(&self, value: &Value) -> Key {
        let get_key = self.inner.borrow().get_key.clone();
        get_key(value)
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    pub fn get(&self, key: &Key) -> Option<Value> {
        self.inner.borrow().state.get(key).cloned()
    }

    pub fn has(&self, key: &Key) -> bool {
        self.inner.borrow().state.has(key)
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visible keys in key order.
    pub fn keys(&self) -> Vec<Key> {
        self.inner.borrow().state.keys()
    }

    /// Visible entries in key order.
    pub fn entries(&self) -> Vec<(Key, Value)> {
        self.inner.borrow().state.entries()
    }

    /// Visible values in key order.
    pub fn to_vec(&self) -> Vec<Value> {
        self.entries().into_iter().map(|(_, v)| v).collect()
    }

    /// Pending optimistic transactions in creation order.
    pub fn pending_transactions(&self) -> Vec<Transaction> {
        self.inner.borrow().state.pending_transactions()
    }

    pub fn status(&self) -> CollectionStatus {
        self.inner.borrow().status
    }

    pub fn is_ready(&self) -> bool {
        self.status() == CollectionStatus::Ready
    }

    /// The error reported by the source, if any.
    pub fn error(&self) -> Option<Error> {
        self.inner.borrow().error.clone()
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Registers a status listener and returns its id.
    pub fn on_status_change<F>(&self, listener: F) -> u64
    where
        F: Fn(CollectionStatus) + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_listener_id;
        inner.next_listener_id += 1;
        inner.status_listeners.insert(id, Rc::new(listener));
        id
    }

    pub fn remove_status_listener(&self, id: u64) -> bool {
        self.inner.borrow_mut().status_listeners.remove(&id).is_some()
    }

    fn set_status(&self, next: CollectionStatus) -> bool {
        let listeners: Vec<StatusListener> = {
            let mut inner = self.inner.borrow_mut();
            if inner.status == next || !inner.status.can_transition_to(next) {
                return false;
            }
            debug_log!("collection {}: {} -> {}", inner.id, inner.status, next);
            inner.status = next;
            let mut ids: Vec<u64> = inner.status_listeners.keys().copied().collect();
            ids.sort_unstable();
            ids.iter().filter_map(|id| inner.status_listeners.get(id).cloned()).collect()
        };
        for listener in listeners {
            listener(next);
        }
        true
    }

    /// Starts syncing from the source. No-op unless idle or cleaned up.
    ///
    /// A collection without a source becomes ready immediately.
    pub fn start_sync(&self) {
        let status = self.status();
        if !matches!(status, CollectionStatus::Idle | CollectionStatus::CleanedUp) {
            return;
        }
        let source = {
            let mut inner = self.inner.borrow_mut();
            inner.error = None;
            if let Some(source) = inner.source.clone() {
                let loader = Rc::new(move |options: &LoadSubsetOptions| source.load_subset(options));
                inner.loader = Some(DeduplicatedLoadSubset::new(loader));
            }
            inner.source.clone()
        };
        self.set_status(CollectionStatus::Loading);
        match source {
            Some(source) => {
                if let Err(err) = source.sync(SyncHandle::new(self.downgrade())) {
                    self.fail(alloc::format!("{}", err));
                }
            }
            None => self.mark_ready(),
        }
    }

    /// Starts syncing if needed; resolves once ready, rejects on error.
    pub fn preload(&self) -> Completion {
        self.start_sync();
        let mut inner = self.inner.borrow_mut();
        match inner.status {
            CollectionStatus::Ready => Completion::resolved(),
            CollectionStatus::Error | CollectionStatus::CleanedUp => {
                let err = inner
                    .error
                    .clone()
                    .unwrap_or_else(|| Error::collection_in_error_state(inner.id.clone()));
                Completion::rejected(err)
            }
            _ => {
                let waiter = Completion::new();
                inner.ready_waiters.push(waiter.clone());
                waiter
            }
        }
    }

    pub(crate) fn mark_ready(&self) {
        if self.set_status(CollectionStatus::Ready) {
            let waiters = core::mem::take(&mut self.inner.borrow_mut().ready_waiters);
            for waiter in waiters {
                waiter.resolve();
            }
        }
    }

    pub(crate) fn fail(&self, message: String) {
        let err = {
            let mut inner = self.inner.borrow_mut();
            let err = Error::sync_failed(inner.id.clone(), message);
            debug_log!("{}", err);
            inner.error = Some(err.clone());
            err
        };
        if self.set_status(CollectionStatus::Error) {
            let waiters = core::mem::take(&mut self.inner.borrow_mut().ready_waiters);
            for waiter in waiters {
                waiter.reject(err.clone());
            }
        }
    }

    /// Releases the source and drops all rows.
    ///
    /// Subscriptions are detached without receiving deletes, so derived
    /// views keep what they already show.
    pub fn cleanup(&self) {
        let (source, subscriptions, waiters, id) = {
            let mut inner = self.inner.borrow_mut();
            inner.state.clear();
            inner.loader = None;
            (
                inner.source.clone(),
                inner.subscriptions.drain(),
                core::mem::take(&mut inner.ready_waiters),
                inner.id.clone(),
            )
        };
        for subscription in subscriptions {
            subscription.deactivate();
        }
        if let Some(source) = source {
            source.cleanup();
        }
        self.set_status(CollectionStatus::CleanedUp);
        for waiter in waiters {
            waiter.reject(Error::collection_in_error_state(id.clone()));
        }
    }

    // ---------------------------------------------------------------------
    // Sync
    // ---------------------------------------------------------------------

    fn commit_sync(&self) -> Result<()> {
        let (outcome, loader) = {
            let mut inner = self.inner.borrow_mut();
            let outcome = inner.state.commit_sync()?;
            if outcome.truncated {
                debug_log!(
                    "collection {}: truncate committed with {} changes",
                    inner.id,
                    outcome.changes.len()
                );
            }
            (outcome, inner.loader.clone())
        };
        if outcome.truncated {
            if let Some(loader) = loader {
                loader.reset();
            }
        }
        self.emit(outcome.changes, outcome.truncated);
        if outcome.truncated && self.status() == CollectionStatus::Loading {
            self.mark_ready();
        }
        Ok(())
    }

    /// Delivers a change set to every subscription.
    ///
    /// On truncate, subscriptions that loaded bounded subsets start buffering
    /// before the changes arrive and re-issue their loads afterwards.
    fn emit(&self, changes: ChangeSet, truncated: bool) {
        if changes.is_empty() && !truncated {
            return;
        }
        let subscriptions = self.inner.borrow().subscriptions.snapshot();
        let mut reloading = Vec::new();
        if truncated {
            for subscription in &subscriptions {
                if subscription.begin_truncate() {
                    reloading.push(subscription.clone());
                }
            }
        }
        if !changes.is_empty() {
            for subscription in &subscriptions {
                subscription.deliver(&changes);
            }
        }
        for subscription in reloading {
            subscription.reissue_loads(self);
        }
    }

    /// Loads a subset from the source, skipping requests already covered.
    pub fn load_subset(&self, options: &LoadSubsetOptions) -> LoadSubsetResult {
        let loader = self.inner.borrow().loader.clone();
        match loader {
            Some(loader) => loader.load_subset(options),
            None => LoadSubsetResult::Loaded,
        }
    }

    // ---------------------------------------------------------------------
    // Local mutations
    // ---------------------------------------------------------------------

    /// Optimistically inserts a row.
    pub fn insert(&self, value: Value) -> Result<Transaction> {
        self.insert_many(vec![value])
    }

    /// Optimistically inserts several rows in one transaction.
    pub fn insert_many(&self, values: Vec<Value>) -> Result<Transaction> {
        let (tx, changes, handler) = {
            let mut inner = self.inner.borrow_mut();
            inner.ensure_usable()?;
            let handler = inner.on_insert.clone().ok_or_else(|| Error::missing_handler("insert"))?;
            let mut seen = HashSet::new();
            let mut mutations = Vec::with_capacity(values.len());
            for value in values {
                let key = (inner.get_key)(&value);
                if inner.state.has(&key) || !seen.insert(key.clone()) {
                    return Err(Error::duplicate_key(inner.id.clone(), &key));
                }
                mutations.push(Mutation::insert(key, value));
            }
            let tx = inner.new_transaction(mutations);
            let changes = inner.state.apply_transaction(tx.clone());
            (tx, changes, handler)
        };
        self.emit(changes, false);
        self.persist(&tx, handler);
        Ok(tx)
    }

    /// Optimistically replaces a row with `f(current)`.
    pub fn update<F>(&self, key: &Key, f: F) -> Result<Transaction>
    where
        F: FnOnce(&Value) -> Value,
    {
        let (tx, changes, handler) = {
            let mut inner = self.inner.borrow_mut();
            inner.ensure_usable()?;
            let handler = inner.on_update.clone().ok_or_else(|| Error::missing_handler("update"))?;
            let original = inner
                .state
                .get(key)
                .cloned()
                .ok_or_else(|| Error::key_not_found(inner.id.clone(), key))?;
            let modified = f(&original);
            let tx = inner.new_transaction(vec![Mutation::update(key.clone(), original, modified)]);
            let changes = inner.state.apply_transaction(tx.clone());
            (tx, changes, handler)
        };
        self.emit(changes, false);
        self.persist(&tx, handler);
        Ok(tx)
    }

    /// Optimistically deletes a row.
    pub fn delete(&self, key: &Key) -> Result<Transaction> {
        let (tx, changes, handler) = {
            let mut inner = self.inner.borrow_mut();
            inner.ensure_usable()?;
            let handler = inner.on_delete.clone().ok_or_else(|| Error::missing_handler("delete"))?;
            let original = inner
                .state
                .get(key)
                .cloned()
                .ok_or_else(|| Error::key_not_found(inner.id.clone(), key))?;
            let tx = inner.new_transaction(vec![Mutation::delete(key.clone(), original)]);
            let changes = inner.state.apply_transaction(tx.clone());
            (tx, changes, handler)
        };
        self.emit(changes, false);
        self.persist(&tx, handler);
        Ok(tx)
    }

    /// Runs the handler and settles or rolls back on its confirmation.
    fn persist(&self, tx: &Transaction, handler: MutationFn) {
        let confirmation = handler(tx);
        let weak = self.downgrade();
        let tx = tx.clone();
        confirmation.on_settle(move |state| {
            let Some(collection) = Collection::from_weak(&weak) else {
                return;
            };
            match state {
                CompletionState::Resolved => collection.settle(&tx),
                CompletionState::Rejected(err) => collection.roll_back(&tx, err.clone()),
                CompletionState::Pending => {}
            }
        });
    }

    fn settle(&self, tx: &Transaction) {
        if !tx.settle() {
            return;
        }
        let changes = self.inner.borrow_mut().state.settle_transaction(tx);
        self.emit(changes, false);
    }

    fn roll_back(&self, tx: &Transaction, err: Error) {
        debug_log!("transaction {} rolled back: {}", tx.id(), err);
        if !tx.roll_back(err) {
            return;
        }
        let changes = self.inner.borrow_mut().state.roll_back_transaction(tx);
        self.emit(changes, false);
    }

    // ---------------------------------------------------------------------
    // Subscriptions
    // ---------------------------------------------------------------------

    /// Subscribes to visible changes. Starts syncing if idle.
    pub fn subscribe_changes<F>(&self, callback: F, options: SubscribeOptions) -> Result<CollectionSubscription>
    where
        F: Fn(&ChangeSet) + 'static,
    {
        let callback: ChangeCallback = Rc::new(callback);
        let subscription = {
            let mut inner = self.inner.borrow_mut();
            let id = inner.subscriptions.next_id();
            let subscription = CollectionSubscription::new(id, self.downgrade(), callback, options.where_expression)?;
            inner.subscriptions.register(subscription.clone());
            subscription
        };
        if self.status() == CollectionStatus::Idle {
            self.start_sync();
        }
        if options.include_initial_state {
            subscription.request_snapshot(None)?;
        }
        Ok(subscription)
    }

    pub(crate) fn remove_subscription(&self, id: u64) -> bool {
        self.inner.borrow_mut().subscriptions.unsubscribe(id)
    }

    /// Number of active subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.borrow().subscriptions.len()
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Collection")
            .field("id", &inner.id)
            .field("status", &inner.status)
            .field("len", &inner.state.len())
            .finish()
    }
}
