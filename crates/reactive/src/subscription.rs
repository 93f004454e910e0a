//! Subscriptions to collection changes.
//!
//! A `CollectionSubscription` delivers a collection's change sets to one
//! callback. It remembers which keys it has delivered so that changes for
//! rows the callback never saw are adjusted: an update of an unseen row is
//! delivered as an insert, a delete of an unseen row is dropped.
//!
//! Subscriptions that loaded bounded subsets (`request_limited_snapshot`)
//! buffer their deliveries while the collection truncates: the truncate
//! deletes and everything that follows are held back until the re-issued
//! loads complete, then flushed as one batch.

use crate::change_set::{ChangeKind, ChangeSet};
use crate::collection::{Collection, CollectionInner};
use alloc::rc::{Rc, Weak};
use alloc::vec::Vec;
use core::cell::RefCell;
use core::cmp::Ordering;
use hashbrown::{HashMap, HashSet};
use rill_core::{debug_log, Completion, CompletionState, Key, Result, Value};
use rill_query::ast::{Expr, OrderByClause};
use rill_query::eval::{compile_order_by, compile_predicate, order_by_comparator, CompiledPredicate};
use rill_query::LoadSubsetOptions;

/// Unique identifier for a subscription within its collection.
pub type SubscriptionId = u64;

/// Callback type for change notifications.
pub type ChangeCallback = Rc<dyn Fn(&ChangeSet)>;

/// Options for `Collection::subscribe_changes`.
#[derive(Clone, Debug, Default)]
pub struct SubscribeOptions {
    /// Deliver the current visible rows as inserts right away.
    pub include_initial_state: bool,
    /// Only deliver rows matching this predicate over bare rows.
    pub where_expression: Option<Expr>,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include_initial_state(mut self) -> Self {
        self.include_initial_state = true;
        self
    }

    pub fn with_where(mut self, expr: Expr) -> Self {
        self.where_expression = Some(expr);
        self
    }
}

#[derive(Default)]
struct DeliveryState {
    active: bool,
    sent_keys: HashSet<Key>,
    /// Every visible row has been delivered; changes pass unfiltered.
    loaded_full_state: bool,
    /// Bounded loads issued by this subscription, re-issued after a truncate.
    loaded_subsets: Vec<LoadSubsetOptions>,
    buffering: bool,
    buffer: ChangeSet,
    pending_reloads: usize,
}

struct Shared {
    id: SubscriptionId,
    collection: Weak<RefCell<CollectionInner>>,
    callback: ChangeCallback,
    where_expression: Option<Expr>,
    predicate: Option<CompiledPredicate>,
    state: RefCell<DeliveryState>,
}

/// A live subscription to a collection's changes.
#[derive(Clone)]
pub struct CollectionSubscription {
    shared: Rc<Shared>,
}

impl CollectionSubscription {
    pub(crate) fn new(
        id: SubscriptionId,
        collection: Weak<RefCell<CollectionInner>>,
        callback: ChangeCallback,
        where_expression: Option<Expr>,
    ) -> Result<Self> {
        let predicate = where_expression.as_ref().map(compile_predicate).transpose()?;
        Ok(Self {
            shared: Rc::new(Shared {
                id,
                collection,
                callback,
                where_expression,
                predicate,
                state: RefCell::new(DeliveryState {
                    active: true,
                    ..DeliveryState::default()
                }),
            }),
        })
    }

    #[inline]
    pub fn id(&self) -> SubscriptionId {
        self.shared.id
    }

    pub fn is_active(&self) -> bool {
        self.shared.state.borrow().active
    }

    /// True while truncate deliveries are held back.
    pub fn is_buffering(&self) -> bool {
        self.shared.state.borrow().buffering
    }

    /// Returns true if the row with `key` was delivered and not deleted since.
    pub fn has_sent(&self, key: &Key) -> bool {
        self.shared.state.borrow().sent_keys.contains(key)
    }

    pub fn sent_key_count(&self) -> usize {
        self.shared.state.borrow().sent_keys.len()
    }

    /// Bounded loads remembered for re-issue after a truncate.
    pub fn loaded_subsets(&self) -> Vec<LoadSubsetOptions> {
        self.shared.state.borrow().loaded_subsets.clone()
    }

    pub fn where_expression(&self) -> Option<&Expr> {
        self.shared.where_expression.as_ref()
    }

    fn collection(&self) -> Option<Collection> {
        Collection::from_weak(&self.shared.collection)
    }

    fn matches(&self, row: &Value) -> bool {
        self.shared.predicate.as_ref().map(|p| p(row)).unwrap_or(true)
    }

    /// Stops delivery and detaches from the collection.
    ///
    /// Loads still in flight complete without reaching the callback.
    pub fn unsubscribe(&self) {
        self.deactivate();
        if let Some(collection) = self.collection() {
            collection.remove_subscription(self.shared.id);
        }
    }

    pub(crate) fn deactivate(&self) {
        let mut state = self.shared.state.borrow_mut();
        state.active = false;
        state.buffering = false;
        state.buffer = ChangeSet::new();
    }

    // ---------------------------------------------------------------------
    // Delivery
    // ---------------------------------------------------------------------

    /// Receives a change set from the collection.
    pub(crate) fn deliver(&self, changes: &ChangeSet) {
        let changes = match &self.shared.predicate {
            Some(predicate) => changes.filtered(predicate),
            None => changes.clone(),
        };
        {
            let mut state = self.shared.state.borrow_mut();
            if !state.active || changes.is_empty() {
                return;
            }
            if state.buffering {
                state.buffer.extend(changes);
                return;
            }
        }
        self.send(changes);
    }

    fn send(&self, changes: ChangeSet) {
        let out = {
            let mut state = self.shared.state.borrow_mut();
            if !state.active {
                return;
            }
            filter_and_flip(&mut state, changes)
        };
        if !out.is_empty() {
            (self.shared.callback)(&out);
        }
    }

    // ---------------------------------------------------------------------
    // Snapshots
    // ---------------------------------------------------------------------

    /// Delivers the visible rows matching the subscription and `extra`.
    ///
    /// Asks the collection to load the same rows from its source. Without
    /// `extra`, the subscription then holds the full state and later changes
    /// are delivered unfiltered. Returns false if there was nothing to do.
    pub fn request_snapshot(&self, extra: Option<Expr>) -> Result<bool> {
        let Some(collection) = self.collection() else {
            return Ok(false);
        };
        {
            let state = self.shared.state.borrow();
            if !state.active || state.loaded_full_state {
                return Ok(false);
            }
        }
        let extra_predicate = extra.as_ref().map(compile_predicate).transpose()?;
        let where_expr = combine(self.shared.where_expression.clone(), extra.clone());

        let mut options = LoadSubsetOptions::new();
        options.where_expr = where_expr;
        collection.load_subset(&options);

        let rows: Vec<(Key, Value)> = {
            let state = self.shared.state.borrow();
            collection
                .entries()
                .into_iter()
                .filter(|(k, v)| {
                    !state.sent_keys.contains(k)
                        && self.matches(v)
                        && extra_predicate.as_ref().map(|p| p(v)).unwrap_or(true)
                })
                .collect()
        };
        self.send(ChangeSet::initial(rows));
        if extra.is_none() {
            self.shared.state.borrow_mut().loaded_full_state = true;
        }
        Ok(true)
    }

    /// Delivers the first `limit` matching rows in `order_by` order that
    /// were not delivered yet, and loads the same window from the source.
    ///
    /// The request is remembered and re-issued if the collection truncates.
    /// The returned completion resolves once the source load finished.
    pub fn request_limited_snapshot(&self, order_by: Vec<OrderByClause>, limit: usize) -> Result<Completion> {
        let Some(collection) = self.collection() else {
            return Ok(Completion::resolved());
        };
        if !self.is_active() {
            return Ok(Completion::resolved());
        }
        let mut options = LoadSubsetOptions::new().with_limit(limit);
        options.where_expr = self.shared.where_expression.clone();
        options.order_by = order_by;

        let mut rows: Vec<(Key, Value)> = collection
            .entries()
            .into_iter()
            .filter(|(_, v)| self.matches(v))
            .collect();
        if !options.order_by.is_empty() {
            let sort_key = compile_order_by(&options.order_by)?;
            let compare = order_by_comparator(&options.order_by);
            let mut keyed: Vec<(Value, (Key, Value))> = rows.into_iter().map(|r| (sort_key(&r.1), r)).collect();
            keyed.sort_by(|a, b| match compare(&a.0, &b.0) {
                Ordering::Equal => a.1 .0.cmp(&b.1 .0),
                other => other,
            });
            rows = keyed.into_iter().map(|(_, r)| r).collect();
        }
        let rows: Vec<(Key, Value)> = {
            let state = self.shared.state.borrow();
            rows.into_iter()
                .take(limit)
                .filter(|(k, _)| !state.sent_keys.contains(k))
                .collect()
        };
        self.send(ChangeSet::initial(rows));

        {
            let mut state = self.shared.state.borrow_mut();
            if !state.loaded_subsets.contains(&options) {
                state.loaded_subsets.push(options.clone());
            }
        }
        Ok(collection.load_subset(&options).into_completion())
    }

    // ---------------------------------------------------------------------
    // Truncate
    // ---------------------------------------------------------------------

    /// Called before the truncate's changes are delivered. Returns true if
    /// the subscription buffers and needs `reissue_loads`.
    pub(crate) fn begin_truncate(&self) -> bool {
        let mut state = self.shared.state.borrow_mut();
        if !state.active || state.loaded_subsets.is_empty() {
            return false;
        }
        // Sent keys are tracked on every delivery, so no back-fill is needed
        // before dropping the full-state shortcut.
        state.loaded_full_state = false;
        state.buffering = true;
        state.pending_reloads += 1;
        true
    }

    /// Re-issues remembered loads and flushes the buffer once all resolve.
    pub(crate) fn reissue_loads(&self, collection: &Collection) {
        let loads = self.loaded_subsets();
        let completions: Vec<Completion> = loads
            .iter()
            .map(|options| collection.load_subset(options).into_completion())
            .collect();
        let weak: Weak<Shared> = Rc::downgrade(&self.shared);
        Completion::all(completions).on_settle(move |result| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if let CompletionState::Rejected(err) = result {
                debug_log!("subscription {}: reload after truncate failed: {}", shared.id, err);
            }
            CollectionSubscription { shared }.finish_reload();
        });
    }

    fn finish_reload(&self) {
        let buffered = {
            let mut state = self.shared.state.borrow_mut();
            state.pending_reloads = state.pending_reloads.saturating_sub(1);
            if state.pending_reloads > 0 || !state.active {
                return;
            }
            state.buffering = false;
            core::mem::take(&mut state.buffer)
        };
        if !buffered.is_empty() {
            self.send(buffered);
        }
    }
}

impl core::fmt::Debug for CollectionSubscription {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.shared.state.borrow();
        f.debug_struct("CollectionSubscription")
            .field("id", &self.shared.id)
            .field("active", &state.active)
            .field("sent_keys", &state.sent_keys.len())
            .field("buffering", &state.buffering)
            .finish()
    }
}

fn combine(a: Option<Expr>, b: Option<Expr>) -> Option<Expr> {
    match (a, b) {
        (Some(a), Some(b)) => Some(Expr::and(alloc::vec![a, b])),
        (a, b) => a.or(b),
    }
}

/// Adjusts changes to what the callback has seen and records delivered keys.
fn filter_and_flip(state: &mut DeliveryState, changes: ChangeSet) -> ChangeSet {
    let mut out = ChangeSet::new();
    for mut change in changes {
        let seen = state.sent_keys.contains(&change.key);
        if !state.loaded_full_state && !seen {
            match change.kind {
                ChangeKind::Delete => continue,
                ChangeKind::Update => {
                    change.kind = ChangeKind::Insert;
                    change.previous_value = None;
                }
                ChangeKind::Insert => {}
            }
        }
        match change.kind {
            ChangeKind::Delete => {
                state.sent_keys.remove(&change.key);
            }
            _ => {
                state.sent_keys.insert(change.key.clone());
            }
        }
        out.push(change);
    }
    out
}

/// Registry of a collection's subscriptions.
pub(crate) struct SubscriptionManager {
    subscriptions: HashMap<SubscriptionId, CollectionSubscription>,
    next_id: SubscriptionId,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self {
            subscriptions: HashMap::new(),
            next_id: 1,
        }
    }

    /// Reserves the next subscription id.
    pub fn next_id(&mut self) -> SubscriptionId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn register(&mut self, subscription: CollectionSubscription) {
        self.subscriptions.insert(subscription.id(), subscription);
    }

    /// Returns true if the subscription was found and removed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscriptions.remove(&id).is_some()
    }

    /// Subscriptions in registration order.
    pub fn snapshot(&self) -> Vec<CollectionSubscription> {
        let mut subs: Vec<CollectionSubscription> = self.subscriptions.values().cloned().collect();
        subs.sort_by_key(|s| s.id());
        subs
    }

    /// Removes and returns every subscription.
    pub fn drain(&mut self) -> Vec<CollectionSubscription> {
        let mut subs: Vec<CollectionSubscription> = self.subscriptions.drain().map(|(_, s)| s).collect();
        subs.sort_by_key(|s| s.id());
        subs
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }
}
