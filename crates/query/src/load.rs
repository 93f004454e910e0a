//! Subset-load requests exchanged with sources.

use crate::ast::{Expr, OrderByClause};
use alloc::rc::Rc;
use alloc::vec::Vec;
use rill_core::Completion;

/// A request for a filtered, ordered and possibly bounded slice of a source.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LoadSubsetOptions {
    /// Predicate over bare source rows (no alias prefix).
    pub where_expr: Option<Expr>,
    pub order_by: Vec<OrderByClause>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl LoadSubsetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_where(mut self, expr: Expr) -> Self {
        self.where_expr = Some(expr);
        self
    }

    pub fn with_order_by(mut self, clause: OrderByClause) -> Self {
        self.order_by.push(clause);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    #[inline]
    pub fn is_limited(&self) -> bool {
        self.limit.is_some()
    }
}

/// Outcome of a subset load.
#[derive(Clone, Debug)]
pub enum LoadSubsetResult {
    /// The data was written and committed before returning.
    Loaded,
    /// The data arrives later; the completion resolves once it is committed.
    Pending(Completion),
}

impl LoadSubsetResult {
    pub fn is_loaded(&self) -> bool {
        matches!(self, LoadSubsetResult::Loaded)
    }

    /// A completion for either outcome; `Loaded` maps to an already resolved one.
    pub fn into_completion(self) -> Completion {
        match self {
            LoadSubsetResult::Loaded => Completion::resolved(),
            LoadSubsetResult::Pending(c) => c,
        }
    }
}

/// A subset loader, as provided by a source.
pub type LoadSubsetFn = Rc<dyn Fn(&LoadSubsetOptions) -> LoadSubsetResult>;
