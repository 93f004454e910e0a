//! Committed state, optimistic overlay and staged sync batches of one collection.
//!
//! `CollectionState` is plain data: it never calls back into user code. Each
//! state transition returns the `ChangeSet` describing how the visible state
//! moved, and the owning `Collection` delivers it once its own borrow is
//! released.

use super::sync::{RowUpdateMode, SyncOperation};
use crate::change_set::ChangeSet;
use crate::transaction::{MutationKind, Transaction, TransactionState};
use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;
use hashbrown::HashSet;
use rill_core::{Error, Key, Result, Value};

/// A write staged in a sync batch, with its key resolved.
#[derive(Clone, Debug)]
enum StagedWrite {
    Insert(Key, Value),
    Update(Key, Value),
    Delete(Key),
}

/// One `begin`..`commit` batch from the source.
#[derive(Default)]
struct PendingSyncTransaction {
    committed: bool,
    truncate: bool,
    writes: Vec<StagedWrite>,
    deleted_keys: HashSet<Key>,
}

/// A transaction layered over the committed state.
///
/// A pending transaction overlays every key it touches. Once settled it only
/// overlays the keys whose committed row the sync stream has not delivered
/// yet, and it is dropped when none remain.
#[derive(Clone, Debug)]
struct Overlay {
    tx: Transaction,
    /// Keys whose mutation the sync stream has reflected since `tx` was applied.
    echoed: BTreeSet<Key>,
}

impl Overlay {
    fn settled(&self) -> bool {
        self.tx.state() == TransactionState::Settled
    }

    /// True once a settled transaction has nothing left to hold.
    fn released(&self) -> bool {
        self.settled() && self.tx.mutations().iter().all(|m| self.echoed.contains(&m.key))
    }
}

/// Result of applying committed sync batches.
pub(crate) struct CommitOutcome {
    pub changes: ChangeSet,
    pub truncated: bool,
}

pub(crate) struct CollectionState {
    synced: BTreeMap<Key, Value>,
    upserts: BTreeMap<Key, Value>,
    deletes: BTreeSet<Key>,
    /// Pending and settled-but-unechoed transactions, in creation order.
    overlays: Vec<Overlay>,
    pending_sync: Vec<PendingSyncTransaction>,
    row_update_mode: RowUpdateMode,
}

impl CollectionState {
    pub fn new(row_update_mode: RowUpdateMode) -> Self {
        Self {
            synced: BTreeMap::new(),
            upserts: BTreeMap::new(),
            deletes: BTreeSet::new(),
            overlays: Vec::new(),
            pending_sync: Vec::new(),
            row_update_mode,
        }
    }

    // ---------------------------------------------------------------------
    // Visible state
    // ---------------------------------------------------------------------

    pub fn get(&self, key: &Key) -> Option<&Value> {
        if self.deletes.contains(key) {
            return None;
        }
        self.upserts.get(key).or_else(|| self.synced.get(key))
    }

    pub fn has(&self, key: &Key) -> bool {
        self.get(key).is_some()
    }

    /// Visible entries in key order.
    pub fn entries(&self) -> Vec<(Key, Value)> {
        let mut visible: BTreeMap<&Key, &Value> = self
            .synced
            .iter()
            .filter(|(k, _)| !self.deletes.contains(*k))
            .collect();
        for (k, v) in &self.upserts {
            visible.insert(k, v);
        }
        visible.into_iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub fn keys(&self) -> Vec<Key> {
        self.entries().into_iter().map(|(k, _)| k).collect()
    }

    pub fn len(&self) -> usize {
        let hidden = self.synced.keys().filter(|k| self.deletes.contains(*k)).count();
        let overlaid = self.upserts.keys().filter(|k| !self.synced.contains_key(*k)).count();
        self.synced.len() - hidden + overlaid
    }

    pub fn synced(&self) -> &BTreeMap<Key, Value> {
        &self.synced
    }

    /// Transactions still waiting for their confirmation, in creation order.
    pub fn pending_transactions(&self) -> Vec<Transaction> {
        self.overlays
            .iter()
            .filter(|o| !o.settled())
            .map(|o| o.tx.clone())
            .collect()
    }

    /// Runs `f` and diffs the visible state of `keys` around it.
    fn tracked<F>(&mut self, keys: BTreeSet<Key>, f: F) -> ChangeSet
    where
        F: FnOnce(&mut Self),
    {
        let before: Vec<(Key, Option<Value>)> = keys
            .into_iter()
            .map(|k| {
                let v = self.get(&k).cloned();
                (k, v)
            })
            .collect();
        f(self);
        ChangeSet::from_states(before.into_iter().map(|(k, old)| {
            let new = self.get(&k).cloned();
            (k, old, new)
        }))
    }

    fn recompute_overlay(&mut self) {
        self.upserts.clear();
        self.deletes.clear();
        for overlay in &self.overlays {
            let settled = overlay.settled();
            for m in overlay.tx.mutations() {
                if settled && overlay.echoed.contains(&m.key) {
                    continue;
                }
                match (&m.kind, &m.modified) {
                    (MutationKind::Delete, _) | (_, None) => {
                        self.upserts.remove(&m.key);
                        self.deletes.insert(m.key.clone());
                    }
                    (_, Some(value)) => {
                        self.deletes.remove(&m.key);
                        self.upserts.insert(m.key.clone(), value.clone());
                    }
                }
            }
        }
    }

    /// Records which overlaid mutations a committed batch reflected.
    ///
    /// While a transaction is pending, only a write matching its mutation
    /// counts: a sync insert or update for an upsert, a sync delete or a
    /// truncate that left the key out for a delete. Once it is settled, any
    /// sync write of the key is authoritative.
    fn record_echoes(&mut self, upserted: &BTreeSet<Key>, deleted: &BTreeSet<Key>, truncated: bool) {
        for overlay in &mut self.overlays {
            let settled = overlay.settled();
            for m in overlay.tx.mutations() {
                let written = upserted.contains(&m.key) || deleted.contains(&m.key);
                let matching = match (&m.kind, &m.modified) {
                    (MutationKind::Delete, _) | (_, None) => {
                        deleted.contains(&m.key) || (truncated && !self.synced.contains_key(&m.key))
                    }
                    _ => upserted.contains(&m.key),
                };
                if matching || (settled && written) {
                    overlay.echoed.insert(m.key.clone());
                }
            }
        }
        self.overlays.retain(|o| !o.released());
    }

    fn transaction_keys(tx: &Transaction) -> BTreeSet<Key> {
        tx.mutations().iter().map(|m| m.key.clone()).collect()
    }

    // ---------------------------------------------------------------------
    // Optimistic transactions
    // ---------------------------------------------------------------------

    /// Layers a new pending transaction over the visible state.
    pub fn apply_transaction(&mut self, tx: Transaction) -> ChangeSet {
        let keys = Self::transaction_keys(&tx);
        self.tracked(keys, |state| {
            state.overlays.push(Overlay {
                tx,
                echoed: BTreeSet::new(),
            });
            state.recompute_overlay();
        })
    }

    /// Marks a confirmed transaction as settled.
    ///
    /// Its values are never written into committed state. Keys the sync
    /// stream already delivered show the committed row from now on; the
    /// others keep the optimistic value until their row arrives.
    pub fn settle_transaction(&mut self, tx: &Transaction) -> ChangeSet {
        let keys = Self::transaction_keys(tx);
        self.tracked(keys, |state| {
            state.overlays.retain(|o| !o.released());
            state.recompute_overlay();
        })
    }

    /// Removes a rolled-back transaction from the overlay.
    pub fn roll_back_transaction(&mut self, tx: &Transaction) -> ChangeSet {
        let keys = Self::transaction_keys(tx);
        self.tracked(keys, |state| {
            state.overlays.retain(|o| !o.tx.ptr_eq(tx));
            state.recompute_overlay();
        })
    }

    // ---------------------------------------------------------------------
    // Sync batches
    // ---------------------------------------------------------------------

    pub fn has_open_sync(&self) -> bool {
        self.pending_sync.last().map(|b| !b.committed).unwrap_or(false)
    }

    pub fn begin_sync(&mut self) {
        self.pending_sync.push(PendingSyncTransaction::default());
    }

    fn open_batch_for_write(&mut self) -> Result<&mut PendingSyncTransaction> {
        let batch = self
            .pending_sync
            .last_mut()
            .ok_or(Error::NoPendingSyncTransactionWrite)?;
        if batch.committed {
            return Err(Error::SyncTransactionAlreadyCommittedWrite);
        }
        Ok(batch)
    }

    /// Stages a write in the open batch.
    pub fn write_sync(&mut self, collection: &str, key: Key, op: SyncOperation) -> Result<()> {
        let synced_value = self.synced.get(&key).cloned();
        let batch = self.open_batch_for_write()?;
        let write = match op {
            SyncOperation::Insert(value) => {
                let exists = synced_value.is_some() && !batch.truncate && !batch.deleted_keys.contains(&key);
                match synced_value {
                    Some(current) if exists => {
                        if current != value {
                            return Err(Error::duplicate_key_sync(collection, &key));
                        }
                        StagedWrite::Update(key, value)
                    }
                    _ => StagedWrite::Insert(key, value),
                }
            }
            SyncOperation::Update(value) => StagedWrite::Update(key, value),
            SyncOperation::Delete(_) => {
                batch.deleted_keys.insert(key.clone());
                StagedWrite::Delete(key)
            }
        };
        batch.writes.push(write);
        Ok(())
    }

    /// Marks the open batch as a truncate.
    ///
    /// Writes staged earlier in the same batch are discarded. The overlay is
    /// untouched, so optimistic rows outlive the rebuild.
    pub fn truncate_sync(&mut self) -> Result<()> {
        let batch = self.open_batch_for_write()?;
        batch.writes.clear();
        batch.deleted_keys.clear();
        batch.truncate = true;
        Ok(())
    }

    /// Commits the open batch and applies every committed batch in order.
    pub fn commit_sync(&mut self) -> Result<CommitOutcome> {
        let batch = self
            .pending_sync
            .last_mut()
            .ok_or(Error::NoPendingSyncTransactionCommit)?;
        if batch.committed {
            return Err(Error::SyncTransactionAlreadyCommitted);
        }
        batch.committed = true;
        Ok(self.apply_committed())
    }

    fn apply_committed(&mut self) -> CommitOutcome {
        let (committed, open): (Vec<_>, Vec<_>) =
            core::mem::take(&mut self.pending_sync).into_iter().partition(|b| b.committed);
        self.pending_sync = open;

        let truncated = committed.iter().any(|b| b.truncate);
        let mut keys: BTreeSet<Key> = BTreeSet::new();
        if truncated {
            keys.extend(self.keys());
        }
        for batch in &committed {
            for write in &batch.writes {
                keys.insert(match write {
                    StagedWrite::Insert(k, _) | StagedWrite::Update(k, _) | StagedWrite::Delete(k) => k.clone(),
                });
            }
        }

        let before: Vec<(Key, Option<Value>)> = keys
            .into_iter()
            .map(|k| {
                let v = self.get(&k).cloned();
                (k, v)
            })
            .collect();

        let mut upserted: BTreeSet<Key> = BTreeSet::new();
        let mut deleted: BTreeSet<Key> = BTreeSet::new();
        for batch in committed {
            if batch.truncate {
                self.synced.clear();
                upserted.clear();
                deleted.clear();
            }
            for write in batch.writes {
                match &write {
                    StagedWrite::Insert(k, _) | StagedWrite::Update(k, _) => {
                        deleted.remove(k);
                        upserted.insert(k.clone());
                    }
                    StagedWrite::Delete(k) => {
                        upserted.remove(k);
                        deleted.insert(k.clone());
                    }
                }
                self.apply_write(write);
            }
        }
        self.record_echoes(&upserted, &deleted, truncated);
        self.recompute_overlay();

        let mut states: Vec<(Key, Option<Value>, Option<Value>)> = before
            .into_iter()
            .map(|(k, old)| {
                let new = self.get(&k).cloned();
                (k, old, new)
            })
            .collect();
        if truncated {
            let seen: BTreeSet<Key> = states.iter().map(|(k, _, _)| k.clone()).collect();
            for (k, v) in self.entries() {
                if !seen.contains(&k) {
                    states.push((k, None, Some(v)));
                }
            }
        }
        CommitOutcome {
            changes: ChangeSet::from_states(states),
            truncated,
        }
    }

    fn apply_write(&mut self, write: StagedWrite) {
        match write {
            StagedWrite::Insert(key, value) => {
                self.synced.insert(key, value);
            }
            StagedWrite::Update(key, value) => {
                let next = match (self.row_update_mode, self.synced.get(&key)) {
                    (RowUpdateMode::Partial, Some(current)) => current.merged_with(&value),
                    _ => value,
                };
                self.synced.insert(key, next);
            }
            StagedWrite::Delete(key) => {
                self.synced.remove(&key);
            }
        }
    }

    /// Drops all state, returning deletes for every visible row.
    pub fn clear(&mut self) -> ChangeSet {
        let keys: BTreeSet<Key> = self.keys().into_iter().collect();
        self.tracked(keys, |state| {
            state.synced.clear();
            state.overlays.clear();
            state.pending_sync.clear();
            state.recompute_overlay();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_set::ChangeKind;
    use crate::transaction::Mutation;
    use alloc::vec;

    const C: &str = "todos";

    fn row(id: i64, title: &str) -> Value {
        Value::object([("id", Value::Int64(id)), ("title", Value::from(title))])
    }

    fn committed(rows: &[(i64, &str)]) -> CollectionState {
        let mut state = CollectionState::new(RowUpdateMode::Partial);
        state.begin_sync();
        for (id, title) in rows {
            state
                .write_sync(C, Key::Int(*id), SyncOperation::Insert(row(*id, title)))
                .unwrap();
        }
        state.commit_sync().unwrap();
        state
    }

    fn kinds(changes: &ChangeSet) -> Vec<(ChangeKind, Key)> {
        changes.iter().map(|c| (c.kind, c.key.clone())).collect()
    }

    #[test]
    fn test_write_requires_open_batch() {
        let mut state = CollectionState::new(RowUpdateMode::Partial);
        assert_eq!(
            state.write_sync(C, Key::Int(1), SyncOperation::Insert(row(1, "a"))),
            Err(Error::NoPendingSyncTransactionWrite)
        );
        assert_eq!(state.commit_sync().err(), Some(Error::NoPendingSyncTransactionCommit));

        state.begin_sync();
        state.commit_sync().unwrap();
        state.begin_sync();
        state.pending_sync.last_mut().unwrap().committed = true;
        assert_eq!(
            state.write_sync(C, Key::Int(1), SyncOperation::Insert(row(1, "a"))),
            Err(Error::SyncTransactionAlreadyCommittedWrite)
        );
        assert_eq!(state.commit_sync().err(), Some(Error::SyncTransactionAlreadyCommitted));
    }

    #[test]
    fn test_duplicate_sync_insert() {
        let mut state = committed(&[(1, "a")]);
        state.begin_sync();
        assert_eq!(
            state.write_sync(C, Key::Int(1), SyncOperation::Insert(row(1, "b"))),
            Err(Error::duplicate_key_sync(C, Key::Int(1)))
        );
        // Deep-equal inserts are applied as updates.
        state.write_sync(C, Key::Int(1), SyncOperation::Insert(row(1, "a"))).unwrap();
        // Delete then insert in one batch is allowed.
        state.write_sync(C, Key::Int(1), SyncOperation::Delete(Key::Int(1))).unwrap();
        state.write_sync(C, Key::Int(1), SyncOperation::Insert(row(1, "c"))).unwrap();
        let outcome = state.commit_sync().unwrap();
        assert_eq!(kinds(&outcome.changes), vec![(ChangeKind::Update, Key::Int(1))]);
        assert_eq!(state.get(&Key::Int(1)), Some(&row(1, "c")));
    }

    #[test]
    fn test_partial_and_full_updates() {
        let mut state = committed(&[(1, "a")]);
        state.begin_sync();
        let patch = Value::object([("done", Value::Boolean(true))]);
        state.write_sync(C, Key::Int(1), SyncOperation::Update(patch.clone())).unwrap();
        state.commit_sync().unwrap();
        assert_eq!(state.get(&Key::Int(1)).unwrap().get_field("title"), Some(&Value::from("a")));

        state.row_update_mode = RowUpdateMode::Full;
        state.begin_sync();
        state.write_sync(C, Key::Int(1), SyncOperation::Update(patch.clone())).unwrap();
        state.commit_sync().unwrap();
        assert_eq!(state.get(&Key::Int(1)), Some(&patch));
    }

    #[test]
    fn test_overlay_and_rollback() {
        let mut state = committed(&[(1, "a")]);
        let tx = Transaction::new(1, C, vec![Mutation::update(Key::Int(1), row(1, "a"), row(1, "b"))]);
        let changes = state.apply_transaction(tx.clone());
        assert_eq!(kinds(&changes), vec![(ChangeKind::Update, Key::Int(1))]);
        assert_eq!(state.get(&Key::Int(1)), Some(&row(1, "b")));

        tx.roll_back(Error::invalid_operation("rejected"));
        let changes = state.roll_back_transaction(&tx);
        assert_eq!(changes.as_slice()[0].value, row(1, "a"));
        assert_eq!(state.get(&Key::Int(1)), Some(&row(1, "a")));
    }

    fn echo(state: &mut CollectionState, op: SyncOperation, key: i64) -> ChangeSet {
        state.begin_sync();
        state.write_sync(C, Key::Int(key), op).unwrap();
        state.commit_sync().unwrap().changes
    }

    #[test]
    fn test_settled_value_waits_for_echo() {
        let mut state = CollectionState::new(RowUpdateMode::Partial);
        let tx = Transaction::new(1, C, vec![Mutation::insert(Key::Int(7), row(7, "x"))]);
        state.apply_transaction(tx.clone());
        tx.settle();
        assert!(state.settle_transaction(&tx).is_empty());
        assert!(state.synced().is_empty());
        assert_eq!(state.get(&Key::Int(7)), Some(&row(7, "x")));
        assert!(state.pending_transactions().is_empty());

        // The committed row differs from the optimistic one and replaces it.
        let mut stamped = row(7, "x");
        stamped.set_field("created_at", Value::Int64(1_700_000_000));
        let changes = echo(&mut state, SyncOperation::Insert(stamped.clone()), 7);
        assert_eq!(kinds(&changes), vec![(ChangeKind::Update, Key::Int(7))]);
        assert_eq!(state.get(&Key::Int(7)), Some(&stamped));
        assert!(state.overlays.is_empty());
    }

    #[test]
    fn test_echo_before_confirmation_releases_on_settle() {
        let mut state = CollectionState::new(RowUpdateMode::Partial);
        let tx = Transaction::new(1, C, vec![Mutation::insert(Key::Int(7), row(7, "x"))]);
        state.apply_transaction(tx.clone());
        let mut stamped = row(7, "x");
        stamped.set_field("created_at", Value::Int64(1));
        assert!(echo(&mut state, SyncOperation::Insert(stamped.clone()), 7).is_empty());
        assert_eq!(state.get(&Key::Int(7)), Some(&row(7, "x")));

        tx.settle();
        let changes = state.settle_transaction(&tx);
        assert_eq!(kinds(&changes), vec![(ChangeKind::Update, Key::Int(7))]);
        assert_eq!(state.get(&Key::Int(7)), Some(&stamped));
        assert!(state.overlays.is_empty());
    }

    #[test]
    fn test_delete_is_not_confirmed_by_a_stale_row() {
        let mut state = committed(&[(1, "a"), (2, "b")]);
        let tx = Transaction::new(1, C, vec![Mutation::delete(Key::Int(1), row(1, "a"))]);
        state.apply_transaction(tx.clone());

        // The server rewrites the row before it has seen the delete.
        echo(&mut state, SyncOperation::Update(row(1, "a2")), 1);
        tx.settle();
        assert!(state.settle_transaction(&tx).is_empty());
        assert!(!state.has(&Key::Int(1)));

        assert!(echo(&mut state, SyncOperation::Delete(Key::Int(1)), 1).is_empty());
        assert!(!state.has(&Key::Int(1)));
        assert!(state.overlays.is_empty());
    }

    #[test]
    fn test_write_after_settle_is_authoritative() {
        let mut state = committed(&[(1, "a")]);
        let tx = Transaction::new(1, C, vec![Mutation::delete(Key::Int(1), row(1, "a"))]);
        state.apply_transaction(tx.clone());
        tx.settle();
        state.settle_transaction(&tx);

        let changes = echo(&mut state, SyncOperation::Update(row(1, "restored")), 1);
        assert_eq!(kinds(&changes), vec![(ChangeKind::Insert, Key::Int(1))]);
        assert_eq!(state.get(&Key::Int(1)).unwrap().get_field("title"), Some(&Value::from("restored")));
    }

    #[test]
    fn test_truncate_minimal_diff() {
        let mut state = committed(&[(1, "a"), (2, "b")]);
        let tx = Transaction::new(1, C, vec![Mutation::insert(Key::Int(3), row(3, "opt"))]);
        state.apply_transaction(tx);

        state.begin_sync();
        state.write_sync(C, Key::Int(9), SyncOperation::Insert(row(9, "discarded"))).unwrap();
        state.truncate_sync().unwrap();
        state.write_sync(C, Key::Int(1), SyncOperation::Insert(row(1, "a"))).unwrap();
        state.write_sync(C, Key::Int(4), SyncOperation::Insert(row(4, "d"))).unwrap();
        let outcome = state.commit_sync().unwrap();

        assert!(outcome.truncated);
        assert_eq!(
            kinds(&outcome.changes),
            vec![(ChangeKind::Delete, Key::Int(2)), (ChangeKind::Insert, Key::Int(4))]
        );
        assert_eq!(state.keys(), vec![Key::Int(1), Key::Int(3), Key::Int(4)]);
        assert_eq!(state.len(), 3);
    }

    #[test]
    fn test_settle_during_truncate_is_kept() {
        let mut state = committed(&[(1, "a")]);
        let before = Transaction::new(1, C, vec![Mutation::insert(Key::Int(2), row(2, "x"))]);
        state.apply_transaction(before.clone());

        state.begin_sync();
        state.truncate_sync().unwrap();
        let during = Transaction::new(2, C, vec![Mutation::insert(Key::Int(3), row(3, "y"))]);
        state.apply_transaction(during.clone());
        before.settle();
        state.settle_transaction(&before);
        during.settle();
        state.settle_transaction(&during);
        state.write_sync(C, Key::Int(1), SyncOperation::Insert(row(1, "a"))).unwrap();
        let outcome = state.commit_sync().unwrap();

        assert!(outcome.changes.is_empty());
        assert_eq!(state.keys(), vec![Key::Int(1), Key::Int(2), Key::Int(3)]);
    }
}
