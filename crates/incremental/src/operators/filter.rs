//! Incremental filter operator.

use crate::delta::{Delta, DeltaBatch};

/// Keeps the deltas whose data satisfies the predicate.
///
/// A filter is stateless: an insert and a later delete of the same data
/// evaluate the predicate identically, so diffs pass through unchanged.
///
/// # Example
///
/// ```ignore
/// let deltas = vec![Delta::insert(10), Delta::insert(5), Delta::delete(20)];
/// let filtered = filter_incremental(deltas, |&x| x > 8);
/// // Result: [Delta::insert(10), Delta::delete(20)]
/// ```
pub fn filter_incremental<T, F>(input: DeltaBatch<T>, predicate: F) -> DeltaBatch<T>
where
    F: Fn(&T) -> bool,
{
    input.into_iter().filter(|d| predicate(&d.data)).collect()
}

/// Borrowing variant of [`filter_incremental`].
pub fn filter_incremental_ref<T, F>(input: &[Delta<T>], predicate: F) -> DeltaBatch<T>
where
    T: Clone,
    F: Fn(&T) -> bool,
{
    input
        .iter()
        .filter(|d| predicate(&d.data))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;

    #[test]
    fn test_filter_incremental_basic() {
        let deltas = vec![
            Delta::insert(10),
            Delta::insert(5),
            Delta::insert(15),
            Delta::delete(20),
        ];

        let filtered = filter_incremental(deltas, |&x| x > 8);

        assert_eq!(filtered.len(), 3);
        assert!(filtered.iter().all(|d| d.data > 8));
    }

    #[test]
    fn test_filter_incremental_preserves_diff() {
        let deltas = vec![Delta::insert(10), Delta::delete(20)];

        let filtered = filter_incremental_ref(&deltas, |&x| x > 5);

        assert_eq!(filtered.len(), 2);
        assert!(filtered[0].is_insert());
        assert!(filtered[1].is_delete());
    }

    #[test]
    fn test_filter_incremental_empty() {
        let deltas: Vec<Delta<i32>> = vec![];
        assert!(filter_incremental(deltas, |&x| x > 0).is_empty());
    }
}
