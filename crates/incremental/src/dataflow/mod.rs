//! Dataflow graph for incremental query evaluation.
//!
//! A graph is built from inputs and operator stages, finalized, and then
//! driven by sending deltas to inputs and calling `run`.

mod graph;
pub mod node;

pub use graph::{DataflowGraph, NodeId};
pub use node::{DataflowNode, MapperFn, Operator, OutputFn, PredicateFn};
