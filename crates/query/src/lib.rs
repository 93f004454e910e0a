//! Rill Query - query IR, optimization and compilation for Rill live queries.
//!
//! This crate provides:
//!
//! - `ast`: query IR (sources, joins, clauses) and expression trees
//! - `eval`: expression compilation and value comparison
//! - `optimizer`: predicate pushdown and redundant subquery removal
//! - `predicate`: subset, union and difference reasoning over predicates
//! - `helpers`: translating expressions into backend-specific filters
//! - `load`: subset-load requests exchanged with sources
//! - `subset_dedupe`: deduplication of overlapping subset loads
//! - `grouping`: GROUP BY, aggregates and HAVING over compiled pipelines
//! - `compiler`: compiling optimized queries into dataflow graphs

#![no_std]

extern crate alloc;

pub mod ast;
pub mod compiler;
pub mod eval;
pub mod grouping;
pub mod helpers;
pub mod load;
pub mod optimizer;
pub mod predicate;
pub mod subset_dedupe;

pub use compiler::{compile_query, CompiledInput, CompiledQuery, OrderHandle, PipelineRow};
pub use load::{LoadSubsetFn, LoadSubsetOptions, LoadSubsetResult};
pub use optimizer::{optimize_query, OptimizationResult, Optimizer};
pub use subset_dedupe::DeduplicatedLoadSubset;
