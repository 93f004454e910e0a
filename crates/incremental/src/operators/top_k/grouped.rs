//! Grouped ORDER BY + LIMIT/OFFSET with fractional indexing.

use super::array::{Comparator, TopKArray, TopKChanges, TopKMoveChanges};
use crate::delta::{consolidate, Delta, DeltaBatch};
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use core::cmp::Ordering;
use core::hash::Hash;
use hashbrown::HashMap;
use rill_core::{Result, Value};

/// Derives the group of an item from its key and value.
pub type GroupKeyFn<K, V> = Rc<dyn Fn(&K, &V) -> Value>;

/// Output element: the key and the value with its fractional index.
pub type TopKOutput<K, V> = (K, (V, String));

/// Window and grouping options.
pub struct GroupedTopKOptions<K, V> {
    /// `None` keeps every item of a group.
    pub limit: Option<usize>,
    pub offset: usize,
    /// `None` places every item in a single group.
    pub group_key: Option<GroupKeyFn<K, V>>,
}

impl<K, V> Default for GroupedTopKOptions<K, V> {
    fn default() -> Self {
        Self {
            limit: None,
            offset: 0,
            group_key: None,
        }
    }
}

impl<K, V> GroupedTopKOptions<K, V> {
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_group_key<F>(mut self, f: F) -> Self
    where
        F: Fn(&K, &V) -> Value + 'static,
    {
        self.group_key = Some(Rc::new(f));
        self
    }
}

/// Per-group state: key multiplicities and the sorted array.
struct TopKState<K, V> {
    multiplicities: HashMap<K, (i32, V)>,
    array: TopKArray<(K, V)>,
}

impl<K, V> TopKState<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    fn new(offset: usize, limit: Option<usize>, comparator: Comparator<(K, V)>) -> Self {
        Self {
            multiplicities: HashMap::new(),
            array: TopKArray::new(offset, limit, comparator),
        }
    }

    /// Applies a multiplicity change. Only presence transitions touch the array.
    fn process(&mut self, key: K, value: V, diff: i32) -> Result<TopKChanges<(K, V)>> {
        let old = self.multiplicities.get(&key).map_or(0, |(m, _)| *m);
        let new = old + diff;

        if old <= 0 && new > 0 {
            self.multiplicities.insert(key.clone(), (new, value.clone()));
            return self.array.insert((key, value));
        }
        if old > 0 && new <= 0 {
            return Ok(match self.multiplicities.remove(&key) {
                Some((_, stored)) => self.array.delete(&(key, stored)),
                None => self.array.delete(&(key, value)),
            });
        }
        if new == 0 {
            self.multiplicities.remove(&key);
        } else if let Some(entry) = self.multiplicities.get_mut(&key) {
            entry.0 = new;
        } else {
            self.multiplicities.insert(key, (new, value));
        }
        Ok(TopKChanges {
            move_in: None,
            move_out: None,
        })
    }

    fn is_empty(&self) -> bool {
        self.multiplicities.is_empty()
    }
}

/// Maintains the `[offset, offset + limit)` window of every group under
/// incremental updates.
///
/// Items are ordered by the value comparator, with ties broken by key so the
/// order is total and stable. Each item receives a fractional index when it is
/// inserted; indices are never reassigned, so consumers can order results by
/// index alone.
pub struct GroupedTopK<K, V> {
    groups: HashMap<Value, TopKState<K, V>>,
    comparator: Comparator<(K, V)>,
    group_key: Option<GroupKeyFn<K, V>>,
    offset: usize,
    limit: Option<usize>,
    size: usize,
}

impl<K, V> GroupedTopK<K, V>
where
    K: Clone + Eq + Hash + Ord + 'static,
    V: Clone + Eq + Hash + 'static,
{
    /// Creates an operator ordering values with `comparator`.
    pub fn new<F>(comparator: F, options: GroupedTopKOptions<K, V>) -> Self
    where
        F: Fn(&V, &V) -> Ordering + 'static,
    {
        let keyed: Comparator<(K, V)> =
            Rc::new(move |a: &(K, V), b: &(K, V)| comparator(&a.1, &b.1).then_with(|| a.0.cmp(&b.0)));
        Self {
            groups: HashMap::new(),
            comparator: keyed,
            group_key: options.group_key,
            offset: options.offset,
            limit: options.limit,
            size: 0,
        }
    }

    /// Total number of items inside the windows of all groups.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of non-empty groups.
    #[inline]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    fn group_of(&self, key: &K, value: &V) -> Value {
        match &self.group_key {
            Some(f) => f(key, value),
            None => Value::Null,
        }
    }

    /// Processes a batch of keyed deltas and returns the window changes.
    pub fn process(&mut self, batch: DeltaBatch<(K, V)>) -> Result<DeltaBatch<TopKOutput<K, V>>> {
        let mut batch = consolidate(batch);
        // Retractions first so that a replaced value leaves before its successor enters.
        batch.sort_by_key(|d| d.diff > 0);

        let mut output = Vec::new();
        for Delta { data: (key, value), diff } in batch {
            let group = self.group_of(&key, &value);
            let (offset, limit, comparator) = (self.offset, self.limit, self.comparator.clone());
            let state = self
                .groups
                .entry(group.clone())
                .or_insert_with(|| TopKState::new(offset, limit, comparator));

            let before = state.array.size();
            let changes = state.process(key, value, diff)?;
            let after = state.array.size();
            let empty = state.is_empty();

            self.size = self.size + after - before;
            if empty {
                self.groups.remove(&group);
            }
            emit(changes, &mut output);
        }
        Ok(consolidate(output))
    }

    /// Changes the window of every group and returns only the items that
    /// entered or left a window. No upstream data is needed.
    pub fn set_window(&mut self, offset: usize, limit: Option<usize>) -> DeltaBatch<TopKOutput<K, V>> {
        self.offset = offset;
        self.limit = limit;
        let mut output = Vec::new();
        let mut size = 0;
        for state in self.groups.values_mut() {
            let TopKMoveChanges {
                move_ins,
                move_outs,
                ..
            } = state.array.move_window(offset, limit);
            for ((k, v), idx) in move_outs {
                output.push(Delta::delete((k, (v, idx))));
            }
            for ((k, v), idx) in move_ins {
                output.push(Delta::insert((k, (v, idx))));
            }
            size += state.array.size();
        }
        self.size = size;
        output
    }

    /// Items in the window of a group, in order.
    pub fn window(&self, group: &Value) -> Vec<TopKOutput<K, V>> {
        self.groups
            .get(group)
            .map(|state| {
                state
                    .array
                    .window()
                    .iter()
                    .map(|((k, v), idx)| (k.clone(), (v.clone(), idx.clone())))
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn emit<K, V>(changes: TopKChanges<(K, V)>, output: &mut DeltaBatch<TopKOutput<K, V>>) {
    if let Some(((k, v), idx)) = changes.move_out {
        output.push(Delta::delete((k, (v, idx))));
    }
    if let Some(((k, v), idx)) = changes.move_in {
        output.push(Delta::insert((k, (v, idx))));
    }
}
