//! Incremental map operator.

use crate::delta::{Delta, DeltaBatch};

/// Transforms the data of every delta, preserving diffs.
pub fn map_incremental<T, U, F>(input: DeltaBatch<T>, mapper: F) -> DeltaBatch<U>
where
    F: Fn(T) -> U,
{
    input
        .into_iter()
        .map(|d| Delta::new(mapper(d.data), d.diff))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::{String, ToString};
    use alloc::vec;

    #[test]
    fn test_map_incremental_basic() {
        let deltas = vec![Delta::insert(1), Delta::insert(2), Delta::delete(3)];

        let mapped = map_incremental(deltas, |x| x * 2);

        assert_eq!(mapped.len(), 3);
        assert_eq!(mapped[0].data, 2);
        assert_eq!(mapped[2].data, 6);
        assert!(mapped[2].is_delete());
    }

    #[test]
    fn test_map_incremental_changes_type() {
        let deltas = vec![Delta::insert(7)];
        let mapped: DeltaBatch<String> = map_incremental(deltas, |x: i32| x.to_string());
        assert_eq!(mapped[0].data, "7");
    }
}
