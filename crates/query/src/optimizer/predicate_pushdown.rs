//! Predicate pushdown optimization pass.
//!
//! Moves WHERE conditions that touch a single source into that source, so the
//! source can filter (and load) less data.
//!
//! Key rules:
//! 1. Conditions are split on AND and grouped by the aliases they reference
//! 2. A collection source is wrapped in a filtering subquery
//! 3. A subquery source only accepts the condition when filtering its output
//!    and filtering its input are equivalent (no aggregation, windowing,
//!    computed or renamed fields, or closures)
//! 4. Under an outer join the pushed condition stays on the outer query as a
//!    residual clause, since null padding happens after the source filter
//! 5. Conditions touching several sources, whole rows, or no source stay put

use crate::ast::{Expr, FromClause, QueryIr, Where};
use crate::optimizer::{OptimizerPass, PassResult};
use alloc::collections::{BTreeMap, BTreeSet};
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use rill_core::{Error, Result};

/// Predicate pushdown optimization.
pub struct PredicatePushdown;

impl OptimizerPass for PredicatePushdown {
    fn optimize(&self, query: &QueryIr) -> Result<PassResult> {
        self.pushdown(query)
    }

    fn name(&self) -> &'static str {
        "predicate_pushdown"
    }
}

/// WHERE conditions grouped by the sources they reference.
#[derive(Debug, Default)]
pub(crate) struct ClauseGroups {
    /// Conditions touching exactly one source, AND-ed per alias.
    pub single_source: BTreeMap<String, Expr>,
    /// Everything else, in original order.
    pub rest: Vec<Expr>,
}

/// Splits nested ANDs into their operands.
pub(crate) fn split_and(expr: &Expr, out: &mut Vec<Expr>) {
    match expr.func_args("and") {
        Some(args) => {
            for arg in args {
                split_and(arg, out);
            }
        }
        None => out.push(expr.clone()),
    }
}

/// Combines conditions with AND; a single condition is returned as is.
pub fn combine_with_and(mut exprs: Vec<Expr>) -> Result<Expr> {
    match exprs.len() {
        0 => Err(Error::EmptyExpressionList),
        1 => Ok(exprs.remove(0)),
        _ => Ok(Expr::and(exprs)),
    }
}

pub(crate) fn group_clauses<'a, I>(clauses: I) -> Result<ClauseGroups>
where
    I: IntoIterator<Item = &'a Expr>,
{
    let mut split = Vec::new();
    for clause in clauses {
        split_and(clause, &mut split);
    }

    let mut per_alias: BTreeMap<String, Vec<Expr>> = BTreeMap::new();
    let mut rest = Vec::new();
    for expr in split {
        let mut refs = Vec::new();
        expr.collect_refs(&mut refs);
        let namespace_only = refs.iter().any(|r| r.is_namespace_only());
        let aliases: BTreeSet<&str> = refs.iter().filter_map(|r| r.alias()).collect();
        match aliases.iter().next() {
            Some(alias) if aliases.len() == 1 && !namespace_only => {
                let alias = String::from(*alias);
                per_alias.entry(alias).or_default().push(expr);
            }
            _ => rest.push(expr),
        }
    }

    let mut single_source = BTreeMap::new();
    for (alias, exprs) in per_alias {
        single_source.insert(alias, combine_with_and(exprs)?);
    }
    Ok(ClauseGroups {
        single_source,
        rest,
    })
}

impl PredicatePushdown {
    fn pushdown(&self, query: &QueryIr) -> Result<PassResult> {
        let mut current = query.clone();
        let mut changed = false;

        // Nested queries first.
        if let Some(from) = self.pushdown_nested(&current.from)? {
            current.from = from;
            changed = true;
        }
        for join in current.join.iter_mut() {
            if let Some(from) = self.pushdown_nested(&join.from)? {
                join.from = from;
                changed = true;
            }
        }

        let level = self.pushdown_level(current)?;
        Ok(PassResult {
            changed: changed || level.changed,
            query: level.query,
        })
    }

    fn pushdown_nested(&self, from: &FromClause) -> Result<Option<FromClause>> {
        let FromClause::Query { query, alias } = from else {
            return Ok(None);
        };
        let result = self.pushdown(query)?;
        Ok(result.changed.then(|| FromClause::Query {
            query: Rc::new(result.query),
            alias: alias.clone(),
        }))
    }

    fn pushdown_level(&self, mut query: QueryIr) -> Result<PassResult> {
        if query.where_clauses.is_empty() {
            return Ok(PassResult::unchanged(query));
        }

        if query.join.is_empty() {
            if query.where_clauses.len() == 1 {
                return Ok(PassResult::unchanged(query));
            }
            let mut parts = Vec::new();
            for clause in &query.where_clauses {
                split_and(&clause.expression, &mut parts);
            }
            query.where_clauses = alloc::vec![Where::new(combine_with_and(parts)?)];
            return Ok(PassResult::changed(query));
        }

        let groups = group_clauses(
            query
                .where_clauses
                .iter()
                .filter(|w| !w.residual)
                .map(|w| &w.expression),
        )?;

        let mut pushed = BTreeSet::new();
        let from = push_into_source(&query.from, &groups.single_source, &mut pushed);
        let joins: Vec<FromClause> = query
            .join
            .iter()
            .map(|j| push_into_source(&j.from, &groups.single_source, &mut pushed))
            .collect();

        let has_outer_joins = query.has_outer_joins();
        let mut remaining = groups.rest;
        let mut residual = Vec::new();
        for (alias, clause) in groups.single_source {
            if !pushed.contains(&alias) {
                remaining.push(clause);
            } else if has_outer_joins {
                residual.push(Where::residual(clause));
            }
        }

        let mut where_clauses = Vec::new();
        if !remaining.is_empty() {
            let mut parts = Vec::new();
            for clause in &remaining {
                split_and(clause, &mut parts);
            }
            where_clauses.push(Where::new(combine_with_and(parts)?));
        }
        where_clauses.extend(residual);
        where_clauses.extend(query.where_clauses.iter().filter(|w| w.residual).cloned());

        let changed = !pushed.is_empty() || where_clauses != query.where_clauses;
        query.from = from;
        for (join, from) in query.join.iter_mut().zip(joins) {
            join.from = from;
        }
        query.where_clauses = where_clauses;
        Ok(PassResult { query, changed })
    }
}

fn push_into_source(
    from: &FromClause,
    single_source: &BTreeMap<String, Expr>,
    pushed: &mut BTreeSet<String>,
) -> FromClause {
    let alias = from.alias();
    let Some(clause) = single_source.get(alias) else {
        return from.clone();
    };
    match from {
        FromClause::Collection { .. } => {
            pushed.insert(String::from(alias));
            FromClause::Query {
                query: Rc::new(QueryIr::new(from.clone()).with_where(clause.clone())),
                alias: String::from(alias),
            }
        }
        FromClause::Query { query, .. } => match rewrite_for_subquery(query, clause, alias) {
            Some(rewritten) => {
                pushed.insert(String::from(alias));
                let mut subquery = QueryIr::clone(query);
                subquery.where_clauses.push(Where::new(rewritten));
                FromClause::Query {
                    query: Rc::new(subquery),
                    alias: String::from(alias),
                }
            }
            None => from.clone(),
        },
    }
}

/// True when filtering the subquery's output equals filtering its input.
fn is_safe_to_push(subquery: &QueryIr) -> bool {
    let aggregates = subquery
        .select
        .as_ref()
        .is_some_and(|select| select.iter().any(|(_, e)| e.contains_aggregate()));
    !aggregates
        && subquery.group_by.is_empty()
        && subquery.having.is_empty()
        && subquery.limit.is_none()
        && subquery.offset.is_none()
        && subquery.fn_select.is_none()
        && subquery.fn_where.is_empty()
        && subquery.fn_having.is_empty()
}

/// Rewrites a condition over `outer_alias.field` into the subquery's own
/// aliases, or returns `None` if it cannot be pushed.
fn rewrite_for_subquery(subquery: &QueryIr, clause: &Expr, outer_alias: &str) -> Option<Expr> {
    if !is_safe_to_push(subquery) {
        return None;
    }
    let inner_from = subquery.from.alias();

    let Some(select) = &subquery.select else {
        // Without a projection a joined subquery emits namespaced rows.
        return subquery
            .join
            .is_empty()
            .then(|| clause.rename_alias(outer_alias, inner_from));
    };

    let mut refs = Vec::new();
    clause.collect_refs(&mut refs);
    let mut target: Option<&str> = None;
    for r in refs.iter().filter(|r| r.alias() == Some(outer_alias)) {
        let field = r.path.get(1)?;
        let (_, projected) = select.iter().find(|(name, _)| name == field)?;
        let inner = projected.as_ref_path()?;
        if inner.path.len() != 2 || &inner.path[1] != field {
            return None;
        }
        let alias = inner.path[0].as_str();
        if alias != outer_alias && alias != inner_from {
            return None;
        }
        if target.is_some_and(|t| t != alias) {
            return None;
        }
        target = Some(alias);
    }
    target.map(|alias| clause.rename_alias(outer_alias, alias))
}
