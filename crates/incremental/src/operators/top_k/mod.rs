//! Ordered top-K per group.
//!
//! - `TopKArray`: one group's sorted items and window
//! - `GroupedTopK`: many groups, multiplicities, window changes
//! - `TopKOperator`: adapts `GroupedTopK` to a dataflow graph stage

mod array;
mod grouped;

pub use array::{Comparator, IndexedItem, TopKArray, TopKChanges, TopKMoveChanges};
pub use grouped::{GroupKeyFn, GroupedTopK, GroupedTopKOptions, TopKOutput};

use crate::dataflow::Operator;
use crate::delta::{Delta, DeltaBatch};
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::hash::Hash;
use rill_core::Result;

struct Shared<K, T> {
    topk: GroupedTopK<K, T>,
    /// Window changes waiting for the next graph run.
    pending: DeltaBatch<TopKOutput<K, T>>,
}

/// Graph stage ordering items of type `T` and attaching fractional indices.
///
/// `key_fn` extracts the item key used for tie-breaking and multiplicity
/// tracking; `attach` stores the assigned index on the emitted item.
pub struct TopKOperator<K, T> {
    shared: Rc<RefCell<Shared<K, T>>>,
    key_fn: Rc<dyn Fn(&T) -> K>,
    attach: Rc<dyn Fn(T, &str) -> T>,
}

/// Handle controlling a `TopKOperator` after it was added to a graph.
pub struct TopKHandle<K, T> {
    shared: Rc<RefCell<Shared<K, T>>>,
}

impl<K, T> Clone for TopKHandle<K, T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<K, T> TopKOperator<K, T>
where
    K: Clone + Eq + Hash + Ord + 'static,
    T: Clone + Eq + Hash + 'static,
{
    /// Wraps a configured `GroupedTopK` and returns the operator with its handle.
    pub fn new<KF, AF>(topk: GroupedTopK<K, T>, key_fn: KF, attach: AF) -> (Self, TopKHandle<K, T>)
    where
        KF: Fn(&T) -> K + 'static,
        AF: Fn(T, &str) -> T + 'static,
    {
        let shared = Rc::new(RefCell::new(Shared {
            topk,
            pending: Vec::new(),
        }));
        (
            Self {
                shared: shared.clone(),
                key_fn: Rc::new(key_fn),
                attach: Rc::new(attach),
            },
            TopKHandle { shared },
        )
    }
}

impl<K, T> TopKHandle<K, T>
where
    K: Clone + Eq + Hash + Ord + 'static,
    T: Clone + Eq + Hash + 'static,
{
    /// Total number of items inside all windows.
    pub fn size(&self) -> usize {
        self.shared.borrow().topk.size()
    }

    pub fn offset(&self) -> usize {
        self.shared.borrow().topk.offset()
    }

    pub fn limit(&self) -> Option<usize> {
        self.shared.borrow().topk.limit()
    }

    /// Moves the window. The resulting changes are emitted by the next graph run.
    pub fn set_window(&self, offset: usize, limit: Option<usize>) {
        let mut shared = self.shared.borrow_mut();
        let moves = shared.topk.set_window(offset, limit);
        shared.pending.extend(moves);
    }
}

impl<K, T> Operator<T> for TopKOperator<K, T>
where
    K: Clone + Eq + Hash + Ord + 'static,
    T: Clone + Eq + Hash + 'static,
{
    fn name(&self) -> &'static str {
        "top_k"
    }

    fn has_pending_output(&self) -> bool {
        !self.shared.borrow().pending.is_empty()
    }

    fn step(&mut self, inputs: Vec<DeltaBatch<T>>) -> Result<DeltaBatch<T>> {
        let mut shared = self.shared.borrow_mut();
        let mut changes = core::mem::take(&mut shared.pending);

        let keyed: DeltaBatch<(K, T)> = inputs
            .into_iter()
            .flatten()
            .map(|d| d.map(|item| ((self.key_fn)(&item), item)))
            .collect();
        if !keyed.is_empty() {
            changes.extend(shared.topk.process(keyed)?);
        }

        Ok(changes
            .into_iter()
            .map(|Delta { data: (_, (item, index)), diff }| Delta::new((self.attach)(item, &index), diff))
            .collect())
    }
}
