//! Weighted changes flowing through the dataflow graph.
//!
//! Every stage consumes and produces batches of [`Delta`]s. A row with
//! multiplicity `n` is present `n` times; an update is a retraction of the old
//! row followed by an assertion of the new one.

use alloc::vec::Vec;
use core::hash::Hash;
use hashbrown::HashMap;

/// A row paired with a signed multiplicity.
///
/// Positive `diff` asserts copies of `data`, negative `diff` retracts them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delta<T> {
    pub data: T,
    pub diff: i32,
}

impl<T> Delta<T> {
    #[inline]
    pub fn new(data: T, diff: i32) -> Self {
        Self { data, diff }
    }

    /// One asserted copy.
    #[inline]
    pub fn insert(data: T) -> Self {
        Self::new(data, 1)
    }

    /// One retracted copy.
    #[inline]
    pub fn delete(data: T) -> Self {
        Self::new(data, -1)
    }

    #[inline]
    pub fn is_insert(&self) -> bool {
        self.diff > 0
    }

    #[inline]
    pub fn is_delete(&self) -> bool {
        self.diff < 0
    }

    /// Transforms the row, keeping its multiplicity.
    #[inline]
    pub fn map<U, F>(self, f: F) -> Delta<U>
    where
        F: FnOnce(T) -> U,
    {
        Delta::new(f(self.data), self.diff)
    }
}

/// A batch of deltas processed together by one stage.
pub type DeltaBatch<T> = Vec<Delta<T>>;

/// Sums the multiplicities of equal rows.
///
/// Rows whose multiplicities cancel are dropped. Surviving rows keep the
/// position of their first occurrence.
pub fn consolidate<T>(batch: DeltaBatch<T>) -> DeltaBatch<T>
where
    T: Eq + Hash + Clone,
{
    let mut positions: HashMap<T, usize> = HashMap::with_capacity(batch.len());
    let mut merged: Vec<Delta<T>> = Vec::with_capacity(batch.len());
    for delta in batch {
        match positions.get(&delta.data) {
            Some(&pos) => merged[pos].diff += delta.diff,
            None => {
                positions.insert(delta.data.clone(), merged.len());
                merged.push(delta);
            }
        }
    }
    merged.retain(|d| d.diff != 0);
    merged
}
