//! Change events emitted by collections.
//!
//! A `ChangeSet` is the ordered list of `ChangeMessage`s produced by one
//! atomic state transition of a collection (a sync commit, a local mutation,
//! a rollback). Deletes always come first so that observers replacing rows
//! never see two rows with the same key.

use alloc::vec::Vec;
use core::slice;
use rill_core::{Key, Value};
use rill_incremental::Delta;
use rill_query::eval::CompiledPredicate;

/// Kind of a single change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A single visible change to a collection.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeMessage {
    pub kind: ChangeKind,
    pub key: Key,
    /// New value for inserts and updates, removed value for deletes.
    pub value: Value,
    /// Value before an update.
    pub previous_value: Option<Value>,
}

impl ChangeMessage {
    pub fn insert(key: Key, value: Value) -> Self {
        Self {
            kind: ChangeKind::Insert,
            key,
            value,
            previous_value: None,
        }
    }

    pub fn update(key: Key, previous: Value, value: Value) -> Self {
        Self {
            kind: ChangeKind::Update,
            key,
            value,
            previous_value: Some(previous),
        }
    }

    pub fn delete(key: Key, value: Value) -> Self {
        Self {
            kind: ChangeKind::Delete,
            key,
            value,
            previous_value: None,
        }
    }

    /// Derives the change between two visible values of one key.
    ///
    /// Returns `None` when nothing observable changed.
    pub fn between(key: Key, before: Option<Value>, after: Option<Value>) -> Option<Self> {
        match (before, after) {
            (None, Some(v)) => Some(Self::insert(key, v)),
            (Some(v), None) => Some(Self::delete(key, v)),
            (Some(old), Some(new)) if old != new => Some(Self::update(key, old, new)),
            _ => None,
        }
    }

    /// Returns true for deletes.
    #[inline]
    pub fn is_delete(&self) -> bool {
        self.kind == ChangeKind::Delete
    }
}

/// An ordered batch of changes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChangeSet {
    changes: Vec<ChangeMessage>,
}

impl ChangeSet {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a change set of inserts, one per row.
    pub fn initial<I>(rows: I) -> Self
    where
        I: IntoIterator<Item = (Key, Value)>,
    {
        Self {
            changes: rows
                .into_iter()
                .map(|(key, value)| ChangeMessage::insert(key, value))
                .collect(),
        }
    }

    /// Builds the minimal change set between two views of the same keys.
    ///
    /// `states` yields `(key, before, after)` per touched key. Deletes are
    /// ordered before updates, updates before inserts.
    pub fn from_states<I>(states: I) -> Self
    where
        I: IntoIterator<Item = (Key, Option<Value>, Option<Value>)>,
    {
        let mut set = Self::new();
        for (key, before, after) in states {
            if let Some(change) = ChangeMessage::between(key, before, after) {
                set.changes.push(change);
            }
        }
        set.sort_deletes_first();
        set
    }

    pub fn push(&mut self, change: ChangeMessage) {
        self.changes.push(change);
    }

    pub fn extend(&mut self, other: ChangeSet) {
        self.changes.extend(other.changes);
    }

    /// Returns true if there are no changes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> slice::Iter<'_, ChangeMessage> {
        self.changes.iter()
    }

    pub fn as_slice(&self) -> &[ChangeMessage] {
        &self.changes
    }

    pub fn into_vec(self) -> Vec<ChangeMessage> {
        self.changes
    }

    /// Stable reorder: deletes, then updates, then inserts.
    pub fn sort_deletes_first(&mut self) {
        self.changes.sort_by_key(|c| match c.kind {
            ChangeKind::Delete => 0,
            ChangeKind::Update => 1,
            ChangeKind::Insert => 2,
        });
    }

    /// Restricts the changes to rows matching `predicate`.
    ///
    /// An update crossing the predicate boundary becomes an insert (row
    /// entered) or a delete of the previous value (row left).
    pub fn filtered(&self, predicate: &CompiledPredicate) -> ChangeSet {
        let mut out = ChangeSet::new();
        for change in &self.changes {
            match change.kind {
                ChangeKind::Insert | ChangeKind::Delete => {
                    if predicate(&change.value) {
                        out.push(change.clone());
                    }
                }
                ChangeKind::Update => {
                    let now = predicate(&change.value);
                    let before = change.previous_value.as_ref().map(|v| predicate(v)).unwrap_or(false);
                    match (before, now) {
                        (true, true) => out.push(change.clone()),
                        (false, true) => out.push(ChangeMessage::insert(change.key.clone(), change.value.clone())),
                        (true, false) => {
                            let previous = change.previous_value.clone().unwrap_or(Value::Null);
                            out.push(ChangeMessage::delete(change.key.clone(), previous));
                        }
                        (false, false) => {}
                    }
                }
            }
        }
        out
    }

    /// Converts the changes into keyed deltas for a dataflow input.
    ///
    /// An update retracts the previous value and asserts the new one.
    pub fn to_deltas(&self) -> Vec<Delta<(Key, Value)>> {
        let mut deltas = Vec::with_capacity(self.changes.len());
        for change in &self.changes {
            match change.kind {
                ChangeKind::Insert => deltas.push(Delta::insert((change.key.clone(), change.value.clone()))),
                ChangeKind::Delete => deltas.push(Delta::delete((change.key.clone(), change.value.clone()))),
                ChangeKind::Update => {
                    if let Some(previous) = &change.previous_value {
                        deltas.push(Delta::delete((change.key.clone(), previous.clone())));
                    }
                    deltas.push(Delta::insert((change.key.clone(), change.value.clone())));
                }
            }
        }
        deltas
    }
}

impl From<Vec<ChangeMessage>> for ChangeSet {
    fn from(changes: Vec<ChangeMessage>) -> Self {
        Self { changes }
    }
}

impl IntoIterator for ChangeSet {
    type Item = ChangeMessage;
    type IntoIter = alloc::vec::IntoIter<ChangeMessage>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.into_iter()
    }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = &'a ChangeMessage;
    type IntoIter = slice::Iter<'a, ChangeMessage>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}
