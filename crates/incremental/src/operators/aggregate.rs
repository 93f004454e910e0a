//! Grouped aggregation.
//!
//! `count`, `sum` and `avg` keep running totals updated by each delta's
//! multiplicity. `min` and `max` keep an ordered multiset of the group's
//! values so a retracted extremum falls back to the next one without a
//! rescan.

use crate::dataflow::Operator;
use crate::delta::{Delta, DeltaBatch};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use hashbrown::{HashMap, HashSet};
use rill_core::{Result, Value};

/// Aggregate functions understood by `GroupedAggregate`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AggregateKind {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateKind {
    /// Parses an aggregate name, ignoring case.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "count" => Some(AggregateKind::Count),
            "sum" => Some(AggregateKind::Sum),
            "avg" => Some(AggregateKind::Avg),
            "min" => Some(AggregateKind::Min),
            "max" => Some(AggregateKind::Max),
            _ => None,
        }
    }
}

/// Running state of one aggregate over one group.
///
/// Nulls are skipped by every function. Non-numeric values count towards
/// `count`, `min` and `max` but add nothing to `sum` and `avg`.
#[derive(Clone, Debug)]
pub struct Accumulator {
    kind: AggregateKind,
    /// Non-null values seen.
    count: i64,
    /// Numeric values seen.
    numeric: i64,
    int_sum: i64,
    float_sum: f64,
    /// Multiplicity of float inputs; the sum stays integral while zero.
    floats: i64,
    ordered: BTreeMap<Value, i64>,
}

impl Accumulator {
    pub fn new(kind: AggregateKind) -> Self {
        Self {
            kind,
            count: 0,
            numeric: 0,
            int_sum: 0,
            float_sum: 0.0,
            floats: 0,
            ordered: BTreeMap::new(),
        }
    }

    /// Adds `diff` copies of `value`. Negative `diff` retracts.
    pub fn apply(&mut self, value: &Value, diff: i32) {
        if value.is_null() || diff == 0 {
            return;
        }
        let diff = diff as i64;
        self.count += diff;
        match value {
            Value::Int64(i) => {
                self.numeric += diff;
                self.int_sum = self.int_sum.wrapping_add(i.wrapping_mul(diff));
                self.float_sum += *i as f64 * diff as f64;
            }
            Value::Float64(f) => {
                self.numeric += diff;
                self.floats += diff;
                self.float_sum += *f * diff as f64;
            }
            _ => {}
        }
        if matches!(self.kind, AggregateKind::Min | AggregateKind::Max) {
            let n = self.ordered.entry(value.clone()).or_insert(0);
            *n += diff;
            if *n <= 0 {
                self.ordered.remove(value);
            }
        }
    }

    /// Current result. Empty groups yield null, except `count` which yields 0.
    pub fn get(&self) -> Value {
        match self.kind {
            AggregateKind::Count => Value::Int64(self.count),
            AggregateKind::Sum if self.numeric == 0 => Value::Null,
            AggregateKind::Sum if self.floats == 0 => Value::Int64(self.int_sum),
            AggregateKind::Sum => Value::Float64(self.float_sum),
            AggregateKind::Avg if self.numeric == 0 => Value::Null,
            AggregateKind::Avg => Value::Float64(self.float_sum / self.numeric as f64),
            AggregateKind::Min => self.ordered.keys().next().cloned().unwrap_or(Value::Null),
            AggregateKind::Max => self.ordered.keys().next_back().cloned().unwrap_or(Value::Null),
        }
    }
}

/// Extracts the aggregated value from an item.
pub type ValueFn<T> = Box<dyn Fn(&T) -> Value>;

/// Builds the output item of a group from its key and aggregate results.
pub type FinishFn<T> = Box<dyn Fn(&Value, &[Value]) -> T>;

struct GroupState<T> {
    rows: i64,
    accumulators: Vec<Accumulator>,
    emitted: Option<T>,
}

/// Graph stage folding items into one output item per group.
///
/// Each touched group retracts its previous output and asserts the new one.
/// A group whose rows are all retracted emits nothing.
pub struct GroupedAggregate<T> {
    group_key: ValueFn<T>,
    aggregates: Vec<(AggregateKind, ValueFn<T>)>,
    finish: FinishFn<T>,
    groups: HashMap<Value, GroupState<T>>,
}

impl<T> GroupedAggregate<T>
where
    T: Clone + PartialEq,
{
    pub fn new<G, F>(group_key: G, finish: F) -> Self
    where
        G: Fn(&T) -> Value + 'static,
        F: Fn(&Value, &[Value]) -> T + 'static,
    {
        Self {
            group_key: Box::new(group_key),
            aggregates: Vec::new(),
            finish: Box::new(finish),
            groups: HashMap::new(),
        }
    }

    /// Adds an aggregate. Results are passed to `finish` in the order added.
    pub fn with_aggregate<V>(mut self, kind: AggregateKind, value: V) -> Self
    where
        V: Fn(&T) -> Value + 'static,
    {
        self.aggregates.push((kind, Box::new(value)));
        self
    }

    /// Number of groups holding rows.
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Applies a batch and returns the output changes of the touched groups.
    pub fn apply(&mut self, batch: DeltaBatch<T>) -> DeltaBatch<T> {
        let mut touched: Vec<Value> = Vec::new();
        let mut seen: HashSet<Value> = HashSet::new();
        for delta in batch {
            if delta.diff == 0 {
                continue;
            }
            let key = (self.group_key)(&delta.data);
            let aggregates = &self.aggregates;
            let group = self.groups.entry(key.clone()).or_insert_with(|| GroupState {
                rows: 0,
                accumulators: aggregates.iter().map(|(kind, _)| Accumulator::new(*kind)).collect(),
                emitted: None,
            });
            group.rows += delta.diff as i64;
            for ((_, value), acc) in aggregates.iter().zip(group.accumulators.iter_mut()) {
                acc.apply(&value(&delta.data), delta.diff);
            }
            if seen.insert(key.clone()) {
                touched.push(key);
            }
        }

        let mut output = Vec::new();
        for key in touched {
            let Some(group) = self.groups.get_mut(&key) else {
                continue;
            };
            let next = if group.rows > 0 {
                let results: Vec<Value> = group.accumulators.iter().map(Accumulator::get).collect();
                Some((self.finish)(&key, &results))
            } else {
                None
            };
            if next != group.emitted {
                if let Some(old) = group.emitted.take() {
                    output.push(Delta::delete(old));
                }
                if let Some(new) = next.clone() {
                    output.push(Delta::insert(new));
                }
                group.emitted = next;
            }
            if group.rows <= 0 {
                self.groups.remove(&key);
            }
        }
        output
    }
}

impl<T> Operator<T> for GroupedAggregate<T>
where
    T: Clone + PartialEq,
{
    fn name(&self) -> &'static str {
        "aggregate"
    }

    fn step(&mut self, mut inputs: Vec<DeltaBatch<T>>) -> Result<DeltaBatch<T>> {
        Ok(self.apply(inputs.pop().unwrap_or_default()))
    }
}
