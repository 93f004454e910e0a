//! Keyed multiset index.
//!
//! Holds consolidated `(key, value) -> multiplicity` state for stateful
//! operators such as the keyed join.

use crate::delta::Delta;
use core::hash::Hash;
use hashbrown::HashMap;

/// A multiset of values grouped by key.
///
/// Entries whose multiplicity reaches zero are removed, and keys without
/// entries are dropped, so the index never grows beyond live data.
#[derive(Clone, Debug)]
pub struct KeyedIndex<K, V>
where
    K: Eq + Hash,
    V: Eq + Hash,
{
    entries: HashMap<K, HashMap<V, i32>>,
    presence: HashMap<K, i32>,
}

impl<K, V> Default for KeyedIndex<K, V>
where
    K: Eq + Hash + Clone,
    V: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> KeyedIndex<K, V>
where
    K: Eq + Hash + Clone,
    V: Eq + Hash + Clone,
{
    /// Creates an empty index.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            presence: HashMap::new(),
        }
    }

    /// Builds an index from a batch of keyed deltas.
    pub fn from_batch<'a, I>(batch: I) -> Self
    where
        I: IntoIterator<Item = &'a Delta<(K, V)>>,
        K: 'a,
        V: 'a,
    {
        let mut index = Self::new();
        for delta in batch {
            index.add(&delta.data.0, &delta.data.1, delta.diff);
        }
        index
    }

    /// Adds `diff` copies of `value` under `key`.
    pub fn add(&mut self, key: &K, value: &V, diff: i32) {
        if diff == 0 {
            return;
        }
        let values = self.entries.entry(key.clone()).or_default();
        let count = values.entry(value.clone()).or_insert(0);
        *count += diff;
        if *count == 0 {
            values.remove(value);
        }
        if values.is_empty() {
            self.entries.remove(key);
        }

        let total = self.presence.entry(key.clone()).or_insert(0);
        *total += diff;
        if *total == 0 {
            self.presence.remove(key);
        }
    }

    /// Applies every delta of another index.
    pub fn append(&mut self, other: &KeyedIndex<K, V>) {
        for (key, values) in &other.entries {
            for (value, diff) in values {
                self.add(key, value, *diff);
            }
        }
    }

    /// Returns the values stored under a key with their multiplicities.
    pub fn get(&self, key: &K) -> impl Iterator<Item = (&V, i32)> + Clone {
        self.entries
            .get(key)
            .into_iter()
            .flat_map(|values| values.iter().map(|(v, d)| (v, *d)))
    }

    /// Net multiplicity stored under a key.
    pub fn presence(&self, key: &K) -> i32 {
        self.presence.get(key).copied().unwrap_or(0)
    }

    /// Iterates over keys holding at least one entry.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    /// Returns the number of keys.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the index holds no entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
