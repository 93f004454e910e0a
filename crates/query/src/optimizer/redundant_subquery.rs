//! Redundant subquery removal.
//!
//! A subquery that only re-emits its source (no filter, projection, grouping,
//! ordering, window, join, or closures) is replaced by that source bound to the
//! outer alias.

use crate::ast::{FromClause, QueryIr};
use crate::optimizer::{OptimizerPass, PassResult};
use alloc::rc::Rc;
use rill_core::Result;

pub struct RedundantSubqueryRemoval;

impl OptimizerPass for RedundantSubqueryRemoval {
    fn optimize(&self, query: &QueryIr) -> Result<PassResult> {
        Ok(self.remove(query))
    }

    fn name(&self) -> &'static str {
        "redundant_subquery_removal"
    }
}

impl RedundantSubqueryRemoval {
    fn remove(&self, query: &QueryIr) -> PassResult {
        let mut current = query.clone();
        let mut changed = false;
        if let Some(from) = self.collapse(&current.from) {
            current.from = from;
            changed = true;
        }
        for join in current.join.iter_mut() {
            if let Some(from) = self.collapse(&join.from) {
                join.from = from;
                changed = true;
            }
        }
        PassResult {
            query: current,
            changed,
        }
    }

    fn collapse(&self, from: &FromClause) -> Option<FromClause> {
        let FromClause::Query { query, alias } = from else {
            return None;
        };
        let inner = self.remove(query);
        if is_redundant(&inner.query) {
            let collapsed = match inner.query.from {
                FromClause::Collection { collection, .. } => FromClause::Collection {
                    collection,
                    alias: alias.clone(),
                },
                FromClause::Query { query, .. } => FromClause::Query {
                    query,
                    alias: alias.clone(),
                },
            };
            return Some(collapsed);
        }
        inner.changed.then(|| FromClause::Query {
            query: Rc::new(inner.query),
            alias: alias.clone(),
        })
    }
}

fn is_redundant(query: &QueryIr) -> bool {
    query.where_clauses.is_empty()
        && query.select.is_none()
        && query.join.is_empty()
        && query.group_by.is_empty()
        && query.having.is_empty()
        && query.order_by.is_empty()
        && query.limit.is_none()
        && query.offset.is_none()
        && !query.distinct
        && query.fn_select.is_none()
        && query.fn_where.is_empty()
        && query.fn_having.is_empty()
}
