//! Fully materialized sorted array with a sliding window.

use crate::fractional_index::generate_key_between;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use core::cmp::Ordering;
use rill_core::Result;

/// Total order over items.
pub type Comparator<V> = Rc<dyn Fn(&V, &V) -> Ordering>;

/// An item paired with its fractional index.
pub type IndexedItem<V> = (V, String);

/// Window changes caused by one insert or delete.
///
/// A single operation moves at most one item into and one item out of the window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopKChanges<V> {
    pub move_in: Option<IndexedItem<V>>,
    pub move_out: Option<IndexedItem<V>>,
}

impl<V> TopKChanges<V> {
    fn none() -> Self {
        Self {
            move_in: None,
            move_out: None,
        }
    }
}

/// Window changes caused by moving the window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopKMoveChanges<V> {
    pub move_ins: Vec<IndexedItem<V>>,
    pub move_outs: Vec<IndexedItem<V>>,
    /// True when the window bounds changed.
    pub changed: bool,
}

/// All items of a group in comparator order, each with its fractional index,
/// plus the window `[start, end)`. `end == None` is an unbounded window.
pub struct TopKArray<V> {
    sorted: Vec<IndexedItem<V>>,
    start: usize,
    end: Option<usize>,
    comparator: Comparator<V>,
}

impl<V: Clone> TopKArray<V> {
    /// Creates an empty array with window `[offset, offset + limit)`.
    pub fn new(offset: usize, limit: Option<usize>, comparator: Comparator<V>) -> Self {
        Self {
            sorted: Vec::new(),
            start: offset,
            end: limit.map(|l| offset.saturating_add(l)),
            comparator,
        }
    }

    /// Number of items inside the window.
    pub fn size(&self) -> usize {
        let available = self.sorted.len().saturating_sub(self.start);
        match self.end {
            Some(end) => available.min(end.saturating_sub(self.start)),
            None => available,
        }
    }

    /// Total number of materialized items.
    #[inline]
    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    /// Items currently inside the window, in order.
    pub fn window(&self) -> &[IndexedItem<V>] {
        let start = self.start.min(self.sorted.len());
        let end = self.window_end();
        &self.sorted[start..end.max(start)]
    }

    /// Every materialized item, in order.
    pub fn items(&self) -> &[IndexedItem<V>] {
        &self.sorted
    }

    fn window_end(&self) -> usize {
        match self.end {
            Some(end) => end.min(self.sorted.len()),
            None => self.sorted.len(),
        }
    }

    #[inline]
    fn before_end(&self, pos: usize) -> bool {
        self.end.map_or(true, |end| pos < end)
    }

    /// Position of the first item not less than `value`.
    fn lower_bound(&self, value: &V) -> usize {
        self.sorted
            .partition_point(|(item, _)| (self.comparator)(item, value) == Ordering::Less)
    }

    /// Inserts an item and assigns it a fractional index between its neighbours.
    pub fn insert(&mut self, value: V) -> Result<TopKChanges<V>> {
        let pos = self.lower_bound(&value);
        let before = pos
            .checked_sub(1)
            .and_then(|p| self.sorted.get(p))
            .map(|(_, idx)| idx.as_str());
        let after = self.sorted.get(pos).map(|(_, idx)| idx.as_str());
        let index = generate_key_between(before, after)?;
        self.sorted.insert(pos, (value, index));

        let mut changes = TopKChanges::none();
        if self.before_end(pos) {
            // The item at max(pos, start) entered the window; whatever sat at
            // `end` was pushed out of it.
            changes.move_in = self.sorted.get(pos.max(self.start)).cloned();
            if let Some(end) = self.end {
                changes.move_out = self.sorted.get(end).cloned();
            }
        }
        Ok(changes)
    }

    /// Removes an item. Unknown items leave the array untouched.
    pub fn delete(&mut self, value: &V) -> TopKChanges<V> {
        let pos = self.lower_bound(value);
        let found = self
            .sorted
            .get(pos)
            .map_or(false, |(item, _)| (self.comparator)(item, value) == Ordering::Equal);
        if !found {
            return TopKChanges::none();
        }
        let removed = self.sorted.remove(pos);

        let mut changes = TopKChanges::none();
        if self.before_end(pos) {
            changes.move_out = if pos < self.start {
                // Everything shifted left by one: the first window item left.
                self.start
                    .checked_sub(1)
                    .and_then(|p| self.sorted.get(p))
                    .cloned()
            } else {
                Some(removed)
            };
            if let Some(end) = self.end {
                changes.move_in = end.checked_sub(1).and_then(|p| self.sorted.get(p)).cloned();
            }
        }
        changes
    }

    /// Moves the window to `[offset, offset + limit)` and reports the items
    /// that entered and left it.
    pub fn move_window(&mut self, offset: usize, limit: Option<usize>) -> TopKMoveChanges<V> {
        let old = (self.start, self.window_end());
        let old_bounds = (self.start, self.end);

        self.start = offset;
        self.end = limit.map(|l| offset.saturating_add(l));
        let new = (self.start.min(self.sorted.len()), self.window_end());
        let old = (old.0.min(self.sorted.len()), old.1);

        let mut move_ins = Vec::new();
        let mut move_outs = Vec::new();
        for i in new.0..new.1.max(new.0) {
            if i < old.0 || i >= old.1 {
                move_ins.push(self.sorted[i].clone());
            }
        }
        for i in old.0..old.1.max(old.0) {
            if i < new.0 || i >= new.1 {
                move_outs.push(self.sorted[i].clone());
            }
        }

        TopKMoveChanges {
            move_ins,
            move_outs,
            changed: old_bounds != (self.start, self.end),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn ascending() -> Comparator<i32> {
        Rc::new(|a: &i32, b: &i32| a.cmp(b))
    }

    fn values(items: &[IndexedItem<i32>]) -> Vec<i32> {
        items.iter().map(|(v, _)| *v).collect()
    }

    fn fill(array: &mut TopKArray<i32>, items: &[i32]) {
        for &v in items {
            array.insert(v).unwrap();
        }
    }

    #[test]
    fn test_insert_into_full_window_moves_boundary_out() {
        let mut array = TopKArray::new(0, Some(3), ascending());
        fill(&mut array, &[10, 20, 30, 40]);
        assert_eq!(values(array.window()), vec![10, 20, 30]);

        let changes = array.insert(15).unwrap();
        assert_eq!(changes.move_in.map(|(v, _)| v), Some(15));
        assert_eq!(changes.move_out.map(|(v, _)| v), Some(30));
        assert_eq!(values(array.window()), vec![10, 15, 20]);
    }

    #[test]
    fn test_insert_outside_window_is_silent() {
        let mut array = TopKArray::new(0, Some(2), ascending());
        fill(&mut array, &[1, 2]);
        let changes = array.insert(5).unwrap();
        assert_eq!(changes, TopKChanges::none());
        assert_eq!(array.size(), 2);
        assert_eq!(array.len(), 3);
    }

    #[test]
    fn test_insert_before_offset_shifts_window() {
        let mut array = TopKArray::new(1, Some(2), ascending());
        fill(&mut array, &[10, 20, 30, 40]);
        assert_eq!(values(array.window()), vec![20, 30]);

        let changes = array.insert(5).unwrap();
        // 10 slides into the window at the offset, 30 slides out.
        assert_eq!(changes.move_in.map(|(v, _)| v), Some(10));
        assert_eq!(changes.move_out.map(|(v, _)| v), Some(30));
        assert_eq!(values(array.window()), vec![10, 20]);
    }

    #[test]
    fn test_delete_in_window_pulls_replacement() {
        let mut array = TopKArray::new(0, Some(2), ascending());
        fill(&mut array, &[1, 2, 3]);
        let changes = array.delete(&1);
        assert_eq!(changes.move_out.map(|(v, _)| v), Some(1));
        assert_eq!(changes.move_in.map(|(v, _)| v), Some(3));
        assert_eq!(values(array.window()), vec![2, 3]);
    }

    #[test]
    fn test_delete_before_offset() {
        let mut array = TopKArray::new(1, Some(2), ascending());
        fill(&mut array, &[1, 2, 3, 4]);
        let changes = array.delete(&1);
        assert_eq!(changes.move_out.map(|(v, _)| v), Some(2));
        assert_eq!(changes.move_in.map(|(v, _)| v), Some(4));
        assert_eq!(values(array.window()), vec![3, 4]);
    }

    #[test]
    fn test_delete_outside_window_is_silent() {
        let mut array = TopKArray::new(0, Some(1), ascending());
        fill(&mut array, &[1, 2, 3]);
        assert_eq!(array.delete(&3), TopKChanges::none());
        assert_eq!(array.delete(&99), TopKChanges::none());
        assert_eq!(array.len(), 2);
    }

    #[test]
    fn test_unbounded_window() {
        let mut array = TopKArray::new(0, None, ascending());
        fill(&mut array, &[3, 1, 2]);
        assert_eq!(values(array.window()), vec![1, 2, 3]);
        let changes = array.delete(&2);
        assert_eq!(changes.move_out.map(|(v, _)| v), Some(2));
        assert!(changes.move_in.is_none());
    }

    #[test]
    fn test_move_window() {
        let mut array = TopKArray::new(0, Some(2), ascending());
        fill(&mut array, &[1, 2, 3, 4, 5]);

        let changes = array.move_window(0, Some(4));
        assert_eq!(values(&changes.move_ins), vec![3, 4]);
        assert!(changes.move_outs.is_empty());
        assert!(changes.changed);

        let changes = array.move_window(2, Some(2));
        assert_eq!(values(&changes.move_outs), vec![1, 2]);
        assert!(changes.move_ins.is_empty());

        let changes = array.move_window(2, Some(2));
        assert!(!changes.changed);
        assert!(changes.move_ins.is_empty() && changes.move_outs.is_empty());

        let changes = array.move_window(3, None);
        assert_eq!(values(&changes.move_outs), vec![3]);
        assert_eq!(values(&changes.move_ins), vec![5]);
    }

    #[test]
    fn test_indices_follow_rank() {
        let mut array = TopKArray::new(0, None, ascending());
        fill(&mut array, &[50, 10, 40, 20, 30, 25, 5]);
        let items = array.items();
        for pair in items.windows(2) {
            assert!(pair[0].0 < pair[1].0);
            assert!(pair[0].1 < pair[1].1);
        }
    }
}
