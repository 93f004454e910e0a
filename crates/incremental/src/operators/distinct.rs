//! Duplicate elimination.

use crate::dataflow::Operator;
use crate::delta::{Delta, DeltaBatch};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::hash::Hash;
use hashbrown::HashMap;
use rill_core::Result;

struct Members<T> {
    /// Items sharing one distinct value, in arrival order.
    items: Vec<(T, i32)>,
    emitted: Option<T>,
}

/// Graph stage passing one item per distinct value of `by`.
///
/// The earliest live item of each value represents it. When the
/// representative is retracted while others remain, the next one takes over.
pub struct Distinct<T, D> {
    by: Box<dyn Fn(&T) -> D>,
    values: HashMap<D, Members<T>>,
}

impl<T, D> Distinct<T, D>
where
    T: Clone + PartialEq,
    D: Clone + Eq + Hash,
{
    pub fn new<F>(by: F) -> Self
    where
        F: Fn(&T) -> D + 'static,
    {
        Self {
            by: Box::new(by),
            values: HashMap::new(),
        }
    }

    /// Number of distinct values currently present.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn apply(&mut self, batch: DeltaBatch<T>) -> DeltaBatch<T> {
        let mut touched: Vec<D> = Vec::new();
        for delta in batch {
            if delta.diff == 0 {
                continue;
            }
            let value = (self.by)(&delta.data);
            let members = self.values.entry(value.clone()).or_insert_with(|| Members {
                items: Vec::new(),
                emitted: None,
            });
            match members.items.iter_mut().find(|(item, _)| *item == delta.data) {
                Some((_, n)) => *n += delta.diff,
                None => members.items.push((delta.data, delta.diff)),
            }
            members.items.retain(|(_, n)| *n != 0);
            touched.push(value);
        }

        let mut output = Vec::new();
        for value in touched {
            let Some(members) = self.values.get_mut(&value) else {
                continue;
            };
            let next = members.items.iter().find(|(_, n)| *n > 0).map(|(item, _)| item.clone());
            if next != members.emitted {
                if let Some(old) = members.emitted.take() {
                    output.push(Delta::delete(old));
                }
                if let Some(new) = next.clone() {
                    output.push(Delta::insert(new));
                }
                members.emitted = next;
            }
            if members.items.is_empty() {
                self.values.remove(&value);
            }
        }
        output
    }
}

impl<T, D> Operator<T> for Distinct<T, D>
where
    T: Clone + PartialEq,
    D: Clone + Eq + Hash,
{
    fn name(&self) -> &'static str {
        "distinct"
    }

    fn step(&mut self, mut inputs: Vec<DeltaBatch<T>>) -> Result<DeltaBatch<T>> {
        Ok(self.apply(inputs.pop().unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn by_parity() -> Distinct<(u32, &'static str), &'static str> {
        Distinct::new(|item: &(u32, &'static str)| item.1)
    }

    #[test]
    fn test_duplicates_collapse() {
        let mut distinct = by_parity();
        let out = distinct.apply(vec![
            Delta::insert((1, "odd")),
            Delta::insert((3, "odd")),
            Delta::insert((2, "even")),
        ]);
        assert_eq!(out, vec![Delta::insert((1, "odd")), Delta::insert((2, "even"))]);
        assert_eq!(distinct.len(), 2);
    }

    #[test]
    fn test_next_member_takes_over() {
        let mut distinct = by_parity();
        distinct.apply(vec![Delta::insert((1, "odd")), Delta::insert((3, "odd"))]);

        let out = distinct.apply(vec![Delta::delete((1, "odd"))]);
        assert_eq!(out, vec![Delta::delete((1, "odd")), Delta::insert((3, "odd"))]);

        let out = distinct.apply(vec![Delta::delete((3, "odd"))]);
        assert_eq!(out, vec![Delta::delete((3, "odd"))]);
        assert!(distinct.is_empty());
    }

    #[test]
    fn test_retracting_a_duplicate_is_silent() {
        let mut distinct = by_parity();
        distinct.apply(vec![Delta::insert((1, "odd")), Delta::insert((3, "odd"))]);
        assert!(distinct.apply(vec![Delta::delete((3, "odd"))]).is_empty());
    }
}
