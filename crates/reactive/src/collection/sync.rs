//! The sync protocol between a source and a collection.
//!
//! A source receives a `SyncHandle` when the collection starts syncing and
//! drives it through `begin` / `write`* / `truncate`? / `commit` batches.
//! Nothing a batch stages is visible before `commit`, and each commit emits
//! one coalesced change set. `mark_ready` flips a loading collection to ready.

use super::{Collection, CollectionInner};
use alloc::rc::Weak;
use alloc::string::String;
use core::cell::RefCell;
use rill_core::{debug_log, Error, Key, Result, Value};
use rill_query::{LoadSubsetOptions, LoadSubsetResult};

/// How a sync `update` is applied to the committed row.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RowUpdateMode {
    /// Object fields of the update are merged into the committed row.
    #[default]
    Partial,
    /// The update replaces the committed row.
    Full,
}

/// A write staged by a source.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncOperation {
    Insert(Value),
    Update(Value),
    Delete(Key),
}

/// A data source feeding a collection.
pub trait SyncSource {
    /// Starts syncing. The source keeps `handle` and writes through it,
    /// synchronously or later.
    fn sync(&self, handle: SyncHandle) -> Result<()>;

    /// Loads a subset of the data on demand.
    ///
    /// Returns `Loaded` when the rows were committed before returning, or
    /// `Pending` with a completion that resolves once they are committed.
    fn load_subset(&self, _options: &LoadSubsetOptions) -> LoadSubsetResult {
        LoadSubsetResult::Loaded
    }

    /// Releases resources when the collection is cleaned up.
    fn cleanup(&self) {}
}

/// Write access to a collection, handed to its source.
#[derive(Clone)]
pub struct SyncHandle {
    collection: Weak<RefCell<CollectionInner>>,
}

impl SyncHandle {
    pub(crate) fn new(collection: Weak<RefCell<CollectionInner>>) -> Self {
        Self { collection }
    }

    fn collection(&self) -> Result<Collection> {
        Collection::from_weak(&self.collection)
            .ok_or_else(|| Error::invalid_operation("collection was dropped"))
    }

    /// Opens a new batch.
    pub fn begin(&self) -> Result<()> {
        let collection = self.collection()?;
        collection.inner.borrow_mut().state.begin_sync();
        Ok(())
    }

    /// Stages a write, deriving the key from the row for inserts and updates.
    pub fn write(&self, op: SyncOperation) -> Result<()> {
        let collection = self.collection()?;
        let key = match &op {
            SyncOperation::Delete(key) => key.clone(),
            SyncOperation::Insert(value) | SyncOperation::Update(value) => collection.key_of(value),
        };
        self.write_keyed(key, op)
    }

    /// Stages a write under an explicit key.
    pub fn write_keyed(&self, key: Key, op: SyncOperation) -> Result<()> {
        let collection = self.collection()?;
        let mut inner = collection.inner.borrow_mut();
        let inner = &mut *inner;
        inner.state.write_sync(&inner.id, key, op)
    }

    /// Marks the open batch as replacing the whole committed data set.
    pub fn truncate(&self) -> Result<()> {
        let collection = self.collection()?;
        let mut inner = collection.inner.borrow_mut();
        debug_log!("collection {}: truncate staged", inner.id);
        inner.state.truncate_sync()
    }

    /// Applies the open batch and notifies subscribers.
    pub fn commit(&self) -> Result<()> {
        let collection = self.collection()?;
        collection.commit_sync()
    }

    /// Marks the collection ready. Idempotent.
    pub fn mark_ready(&self) -> Result<()> {
        self.collection()?.mark_ready();
        Ok(())
    }

    /// Puts the collection into the error state. Visible data is kept.
    pub fn fail(&self, message: impl Into<String>) -> Result<()> {
        self.collection()?.fail(message.into());
        Ok(())
    }

    /// Returns true while a batch is open.
    pub fn has_open_batch(&self) -> bool {
        Collection::from_weak(&self.collection)
            .map(|c| {
                let open = c.inner.borrow().state.has_open_sync();
                open
            })
            .unwrap_or(false)
    }
}
