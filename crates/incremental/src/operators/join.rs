//! Incremental keyed join operator.

use crate::dataflow::Operator;
use crate::delta::{consolidate, Delta, DeltaBatch};
use crate::index::KeyedIndex;
use alloc::boxed::Box;
use alloc::vec::Vec;
use rill_core::Result;
use core::hash::Hash;
use hashbrown::HashSet;

/// Join semantics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
}

impl JoinType {
    #[inline]
    fn pads_left_rows(self) -> bool {
        matches!(self, JoinType::Left | JoinType::Full)
    }

    #[inline]
    fn pads_right_rows(self) -> bool {
        matches!(self, JoinType::Right | JoinType::Full)
    }
}

/// A joined pair. The side missing from an outer join row is `None`.
pub type JoinedPair<L, R> = (Option<L>, Option<R>);

/// Incremental equi-join keyed by `K`.
///
/// Both sides are kept in consolidated keyed indexes. For new deltas the
/// matched output is `ΔL⋈R + L⋈ΔR + ΔL⋈ΔR` against the state before this step.
/// Outer joins additionally track per-key presence on the opposite side: a key
/// gaining its first match retracts the null-padded rows, a key losing its last
/// match re-emits them.
pub struct IncrementalJoin<K, L, R>
where
    K: Eq + Hash,
    L: Eq + Hash,
    R: Eq + Hash,
{
    join_type: JoinType,
    left: KeyedIndex<K, L>,
    right: KeyedIndex<K, R>,
}

impl<K, L, R> IncrementalJoin<K, L, R>
where
    K: Eq + Hash + Clone,
    L: Eq + Hash + Clone,
    R: Eq + Hash + Clone,
{
    /// Creates a join with empty state.
    pub fn new(join_type: JoinType) -> Self {
        Self {
            join_type,
            left: KeyedIndex::new(),
            right: KeyedIndex::new(),
        }
    }

    #[inline]
    pub fn join_type(&self) -> JoinType {
        self.join_type
    }

    /// Number of distinct keys held on the left side.
    pub fn left_len(&self) -> usize {
        self.left.len()
    }

    /// Number of distinct keys held on the right side.
    pub fn right_len(&self) -> usize {
        self.right.len()
    }

    /// Processes one step of left and right deltas and returns the output deltas.
    pub fn step(
        &mut self,
        left_batch: &[Delta<(K, L)>],
        right_batch: &[Delta<(K, R)>],
    ) -> DeltaBatch<(K, JoinedPair<L, R>)> {
        if left_batch.is_empty() && right_batch.is_empty() {
            return Vec::new();
        }
        let delta_left = KeyedIndex::from_batch(left_batch);
        let delta_right = KeyedIndex::from_batch(right_batch);
        let mut output = Vec::new();

        // ΔL ⋈ R_old
        for key in delta_left.keys() {
            cross(key, delta_left.get(key), self.right.get(key), &mut output);
        }
        // L_old ⋈ ΔR
        for key in delta_right.keys() {
            cross(key, self.left.get(key), delta_right.get(key), &mut output);
        }
        // ΔL ⋈ ΔR
        for key in delta_left.keys() {
            cross(key, delta_left.get(key), delta_right.get(key), &mut output);
        }

        if self.join_type.pads_left_rows() {
            let keys: HashSet<&K> = delta_left.keys().chain(delta_right.keys()).collect();
            for key in keys {
                let before = self.right.presence(key);
                let after = before + delta_right.presence(key);
                pad(
                    key,
                    before,
                    after,
                    self.left.get(key),
                    delta_left.get(key),
                    |l: &L| (Some(l.clone()), None),
                    &mut output,
                );
            }
        }
        if self.join_type.pads_right_rows() {
            let keys: HashSet<&K> = delta_left.keys().chain(delta_right.keys()).collect();
            for key in keys {
                let before = self.left.presence(key);
                let after = before + delta_left.presence(key);
                pad(
                    key,
                    before,
                    after,
                    self.right.get(key),
                    delta_right.get(key),
                    |r: &R| (None, Some(r.clone())),
                    &mut output,
                );
            }
        }

        self.left.append(&delta_left);
        self.right.append(&delta_right);

        consolidate(output)
    }
}

type KeyFn<T, K> = Box<dyn Fn(&T) -> K>;
type CombineFn<T> = Box<dyn Fn(Option<T>, Option<T>) -> T>;

/// Graph stage joining two streams of the same item type.
///
/// Port 0 is the left input, port 1 the right input. `combine` builds the
/// output item from a joined pair.
pub struct JoinOperator<K, T>
where
    K: Eq + Hash,
    T: Eq + Hash,
{
    join: IncrementalJoin<K, T, T>,
    left_key: KeyFn<T, K>,
    right_key: KeyFn<T, K>,
    combine: CombineFn<T>,
}

impl<K, T> JoinOperator<K, T>
where
    K: Eq + Hash + Clone,
    T: Eq + Hash + Clone,
{
    pub fn new<LF, RF, CF>(join_type: JoinType, left_key: LF, right_key: RF, combine: CF) -> Self
    where
        LF: Fn(&T) -> K + 'static,
        RF: Fn(&T) -> K + 'static,
        CF: Fn(Option<T>, Option<T>) -> T + 'static,
    {
        Self {
            join: IncrementalJoin::new(join_type),
            left_key: Box::new(left_key),
            right_key: Box::new(right_key),
            combine: Box::new(combine),
        }
    }
}

impl<K, T> Operator<T> for JoinOperator<K, T>
where
    K: Eq + Hash + Clone,
    T: Eq + Hash + Clone,
{
    fn name(&self) -> &'static str {
        "join"
    }

    fn arity(&self) -> usize {
        2
    }

    fn step(&mut self, inputs: Vec<DeltaBatch<T>>) -> Result<DeltaBatch<T>> {
        let mut inputs = inputs.into_iter();
        let left: DeltaBatch<(K, T)> = inputs
            .next()
            .unwrap_or_default()
            .into_iter()
            .map(|d| d.map(|item| ((self.left_key)(&item), item)))
            .collect();
        let right: DeltaBatch<(K, T)> = inputs
            .next()
            .unwrap_or_default()
            .into_iter()
            .map(|d| d.map(|item| ((self.right_key)(&item), item)))
            .collect();

        Ok(self
            .join
            .step(&left, &right)
            .into_iter()
            .map(|d| d.map(|(_, (l, r))| (self.combine)(l, r)))
            .collect())
    }
}

fn cross<'a, K, L, R>(
    key: &K,
    left: impl Iterator<Item = (&'a L, i32)>,
    right: impl Iterator<Item = (&'a R, i32)> + Clone,
    output: &mut DeltaBatch<(K, JoinedPair<L, R>)>,
) where
    K: Clone,
    L: Clone + 'a,
    R: Clone + 'a,
{
    for (l, ld) in left {
        for (r, rd) in right.clone() {
            output.push(Delta::new(
                (key.clone(), (Some(l.clone()), Some(r.clone()))),
                ld * rd,
            ));
        }
    }
}

/// Emits null-padded rows for one side given the opposite side's presence
/// before and after this step.
fn pad<'a, K, S, L, R, F>(
    key: &K,
    opposite_before: i32,
    opposite_after: i32,
    old_rows: impl Iterator<Item = (&'a S, i32)>,
    delta_rows: impl Iterator<Item = (&'a S, i32)> + Clone,
    padded: F,
    output: &mut DeltaBatch<(K, JoinedPair<L, R>)>,
) where
    K: Clone,
    S: 'a,
    F: Fn(&S) -> JoinedPair<L, R>,
{
    match (opposite_before > 0, opposite_after > 0) {
        (false, false) => {
            for (row, diff) in delta_rows {
                output.push(Delta::new((key.clone(), padded(row)), diff));
            }
        }
        (false, true) => {
            for (row, diff) in old_rows {
                output.push(Delta::new((key.clone(), padded(row)), -diff));
            }
        }
        (true, false) => {
            for (row, diff) in old_rows.chain(delta_rows) {
                output.push(Delta::new((key.clone(), padded(row)), diff));
            }
        }
        (true, true) => {}
    }
}
