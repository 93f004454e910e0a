//! Query optimizer module.

mod pass;
mod predicate_pushdown;
mod redundant_subquery;

pub use pass::{OptimizerPass, PassResult};
pub use predicate_pushdown::{combine_with_and, PredicatePushdown};
pub use redundant_subquery::RedundantSubqueryRemoval;

use crate::ast::{Expr, FromClause, QueryIr};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use rill_core::{debug_log, Result};

/// Default bound on fixpoint iterations.
pub const DEFAULT_MAX_ITERATIONS: usize = 10;

/// Result of optimizing a query.
#[derive(Clone, Debug)]
pub struct OptimizationResult {
    pub query: QueryIr,
    /// Per-alias conditions over collection sources, taken from the query
    /// before rewriting. Used to narrow what each source subscription loads.
    pub source_where_clauses: BTreeMap<String, Expr>,
    /// Fixpoint iterations run.
    pub iterations: usize,
}

/// Query optimizer that applies optimization passes.
pub struct Optimizer {
    passes: Vec<Box<dyn OptimizerPass>>,
    cleanup: Vec<Box<dyn OptimizerPass>>,
    max_iterations: usize,
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Optimizer {
    /// Creates a new optimizer with default passes.
    ///
    /// `PredicatePushdown` runs until nothing changes (bounded by
    /// `DEFAULT_MAX_ITERATIONS`), then `RedundantSubqueryRemoval` runs once.
    pub fn new() -> Self {
        Self {
            passes: alloc::vec![Box::new(PredicatePushdown)],
            cleanup: alloc::vec![Box::new(RedundantSubqueryRemoval)],
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    /// Creates an optimizer with custom fixpoint passes.
    pub fn with_passes(passes: Vec<Box<dyn OptimizerPass>>) -> Self {
        Self {
            passes,
            ..Self::new()
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// Optimizes a query tree. The input is left untouched.
    pub fn optimize(&self, query: &QueryIr) -> Result<OptimizationResult> {
        let source_where_clauses = extract_source_where_clauses(query)?;

        let mut current = query.clone();
        let mut iterations = 0;
        loop {
            let mut changed = false;
            for pass in &self.passes {
                let result = pass.optimize(&current)?;
                changed |= result.changed;
                current = result.query;
            }
            iterations += 1;
            if !changed {
                break;
            }
            if iterations >= self.max_iterations {
                debug_log!(
                    "optimizer stopped after {} iterations without reaching a fixpoint",
                    iterations
                );
                break;
            }
        }

        for pass in &self.cleanup {
            current = pass.optimize(&current)?.query;
        }

        Ok(OptimizationResult {
            query: current,
            source_where_clauses,
            iterations,
        })
    }
}

/// Optimizes a query with the default optimizer.
pub fn optimize_query(query: &QueryIr) -> Result<OptimizationResult> {
    Optimizer::new().optimize(query)
}

/// Conditions of the top-level WHERE that touch exactly one collection
/// source, AND-ed per alias.
pub fn extract_source_where_clauses(query: &QueryIr) -> Result<BTreeMap<String, Expr>> {
    if query.where_clauses.is_empty() {
        return Ok(BTreeMap::new());
    }
    let groups = predicate_pushdown::group_clauses(query.where_clauses.iter().map(|w| &w.expression))?;
    Ok(groups
        .single_source
        .into_iter()
        .filter(|(alias, _)| {
            query
                .source(alias)
                .is_some_and(FromClause::is_collection)
        })
        .collect())
}
