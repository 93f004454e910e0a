//! Optimizer pass trait.

use crate::ast::QueryIr;
use rill_core::Result;

/// Output of one pass over a query tree.
#[derive(Clone, Debug)]
pub struct PassResult {
    pub query: QueryIr,
    /// True if the pass rewrote anything.
    pub changed: bool,
}

impl PassResult {
    pub fn changed(query: QueryIr) -> Self {
        Self { query, changed: true }
    }

    pub fn unchanged(query: QueryIr) -> Self {
        Self {
            query,
            changed: false,
        }
    }
}

/// An optimization pass that rewrites a query tree.
///
/// Passes never mutate their input; they return a new tree and report
/// whether it differs.
pub trait OptimizerPass {
    /// Optimizes the given query.
    fn optimize(&self, query: &QueryIr) -> Result<PassResult>;

    /// Returns the name of this pass.
    fn name(&self) -> &'static str {
        "unnamed"
    }
}
