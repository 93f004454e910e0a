//! Rill Incremental - differential dataflow substrate for Rill live queries.
//!
//! Query results are maintained by propagating deltas through operators
//! instead of recomputing from scratch.
//!
//! # Core Concepts
//!
//! - `Delta<T>`: a change to an item with a multiplicity (+1 insert, -1 delete)
//! - `DataflowGraph<T>`: inputs and operator stages, finalized then run
//! - `KeyedIndex<K, V>`: consolidated keyed multiset used by stateful operators
//!
//! # Incremental Operators
//!
//! - `filter_incremental` / `map_incremental`: stateless stages
//! - `IncrementalJoin`: inner, left, right and full keyed joins
//! - `GroupedAggregate`: per-group count/sum/avg/min/max
//! - `Distinct`: one item per distinct value
//! - `GroupedTopK`: per-group ORDER BY with LIMIT/OFFSET windows, assigning
//!   fractional indices that never need renumbering
//!
//! # Example
//!
//! ```ignore
//! use rill_incremental::{DataflowGraph, Delta};
//!
//! let mut graph = DataflowGraph::new();
//! let input = graph.add_input()?;
//! let adults = graph.filter(input, |age: &i64| *age >= 18)?;
//! graph.output(adults, |batch| println!("{:?}", batch))?;
//! graph.finalize();
//!
//! graph.send(input, vec![Delta::insert(25), Delta::insert(12)])?;
//! graph.run()?;
//! ```

#![no_std]

extern crate alloc;

pub mod dataflow;
pub mod delta;
pub mod fractional_index;
pub mod index;
pub mod operators;

pub use dataflow::{DataflowGraph, DataflowNode, NodeId, Operator};
pub use delta::{consolidate, Delta, DeltaBatch};
pub use fractional_index::generate_key_between;
pub use index::KeyedIndex;
pub use operators::top_k::{
    Comparator, GroupKeyFn, IndexedItem, TopKChanges, TopKMoveChanges, TopKOutput,
};
pub use operators::{
    filter_incremental, filter_incremental_ref, map_incremental, Accumulator, AggregateKind, Distinct,
    GroupedAggregate, GroupedTopK, GroupedTopKOptions, IncrementalJoin, JoinOperator, JoinType, JoinedPair,
    TopKArray, TopKHandle, TopKOperator,
};
