//! Incremental operators.
//!
//! - Filter: passes through deltas matching a predicate
//! - Map: transforms deltas using a mapper function
//! - Join: keyed inner/left/right/full join over consolidated indexes
//! - Top-K: grouped ORDER BY with LIMIT/OFFSET and fractional indices
//! - Aggregate: GROUP BY with count/sum/avg/min/max
//! - Distinct: one item per distinct value

mod aggregate;
mod distinct;
mod filter;
mod join;
mod map;
pub mod top_k;

pub use aggregate::{Accumulator, AggregateKind, FinishFn, GroupedAggregate, ValueFn};
pub use distinct::Distinct;
pub use filter::{filter_incremental, filter_incremental_ref};
pub use join::{IncrementalJoin, JoinOperator, JoinType, JoinedPair};
pub use map::map_incremental;
pub use top_k::{GroupedTopK, GroupedTopKOptions, TopKArray, TopKHandle, TopKOperator};
