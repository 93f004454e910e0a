//! GROUP BY, aggregates and HAVING.
//!
//! A grouped query folds its filtered rows into one `PipelineRow` per group.
//! The grouped row's `result` is the projection and its `namespaced` object
//! holds that projection under `$selected`, so HAVING and ORDER BY are
//! evaluated against the projected fields. Aggregates and grouping
//! expressions in those clauses are rewritten into references to the
//! matching SELECT entry.

use crate::ast::{Expr, OrderByClause, QueryIr, Select};
use crate::compiler::PipelineRow;
use crate::eval::{compile_expression, CompiledExpr};
use alloc::collections::BTreeMap;
use alloc::format;
use alloc::rc::Rc;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use rill_core::{Error, Key, Result, Value};
use rill_incremental::{AggregateKind, GroupedAggregate};

/// Namespace under which a grouped row exposes its projection.
pub const SELECTED: &str = "$selected";

/// Key of the single group formed by aggregates without GROUP BY.
const SINGLE_GROUP: &str = "single_group";

/// Where a projected field of a grouped row comes from.
#[derive(Clone, Copy)]
enum Slot {
    /// The n-th GROUP BY value.
    Key(usize),
    /// The n-th aggregate result.
    Aggregate(usize),
}

/// Builds the aggregation stage of a grouped query.
pub fn grouped_aggregate(query: &QueryIr) -> Result<GroupedAggregate<PipelineRow>> {
    if query.fn_select.is_some() {
        return Err(Error::unsupported("functional select with GROUP BY"));
    }
    let keys = query
        .group_by
        .iter()
        .map(compile_expression)
        .collect::<Result<Vec<CompiledExpr>>>()?;

    let mut slots: Vec<(String, Slot)> = Vec::new();
    let mut aggregates: Vec<(AggregateKind, CompiledExpr)> = Vec::new();
    match &query.select {
        Some(select) => {
            for (name, expr) in select {
                let slot = match expr {
                    Expr::Agg { name: function, args } => {
                        let kind = AggregateKind::from_name(function)
                            .ok_or_else(|| Error::unsupported(format!("aggregate function '{}'", function)))?;
                        let value: CompiledExpr = match args.first() {
                            Some(arg) => compile_expression(arg)?,
                            None => Rc::new(|_: &Value| Value::Boolean(true)),
                        };
                        aggregates.push((kind, value));
                        Slot::Aggregate(aggregates.len() - 1)
                    }
                    _ if expr.contains_aggregate() => {
                        return Err(Error::unsupported(format!(
                            "aggregate nested inside expression '{}'",
                            expr
                        )))
                    }
                    _ => {
                        let index = query.group_by.iter().position(|g| g == expr).ok_or_else(|| {
                            Error::invalid_operation(format!(
                                "non-aggregate expression '{}' in SELECT must appear in GROUP BY",
                                name
                            ))
                        })?;
                        Slot::Key(index)
                    }
                };
                slots.push((name.clone(), slot));
            }
        }
        None => {
            for i in 0..query.group_by.len() {
                slots.push((key_field(i), Slot::Key(i)));
            }
        }
    }

    let group_key = move |row: &PipelineRow| Value::Array(keys.iter().map(|k| k(&row.namespaced)).collect());
    let finish = move |key: &Value, results: &[Value]| {
        let parts = key.as_array().unwrap_or(&[]);
        let result: BTreeMap<String, Value> = slots
            .iter()
            .map(|(name, slot)| {
                let value = match slot {
                    Slot::Key(i) => parts.get(*i),
                    Slot::Aggregate(i) => results.get(*i),
                };
                (name.clone(), value.cloned().unwrap_or(Value::Null))
            })
            .collect();
        let result = Value::Object(result);
        let mut namespaced = BTreeMap::new();
        namespaced.insert(String::from(SELECTED), result.clone());
        PipelineRow {
            key: group_row_key(parts),
            namespaced: Value::Object(namespaced),
            result: Some(result),
            order_index: None,
        }
    };

    let mut stage = GroupedAggregate::new(group_key, finish);
    for (kind, value) in aggregates {
        stage = stage.with_aggregate(kind, move |row: &PipelineRow| value(&row.namespaced));
    }
    Ok(stage)
}

/// Output key of a group: the grouping value itself when there is exactly
/// one, otherwise its serialized tuple.
fn group_row_key(parts: &[Value]) -> Key {
    match parts {
        [] => Key::Str(String::from(SINGLE_GROUP)),
        [one] => Key::from_value(one).unwrap_or_else(|| Key::Str(one.to_string())),
        many => Key::Str(Value::Array(many.to_vec()).to_string()),
    }
}

fn key_field(i: usize) -> String {
    format!("__key_{}", i)
}

/// Rewrites a HAVING or ORDER BY expression of a grouped query so it reads
/// the grouped row.
///
/// Subexpressions equal to a SELECT entry become `$selected.<name>`. Without
/// a projection, GROUP BY expressions map to their `__key_<n>` fields. An
/// aggregate that is not projected cannot be evaluated and is rejected.
pub fn rewrite_for_groups(expr: &Expr, query: &QueryIr) -> Result<Expr> {
    if let Some(name) = selected_name(expr, query) {
        return Ok(Expr::reference([String::from(SELECTED), name]));
    }
    match expr {
        Expr::Agg { .. } => Err(Error::invalid_operation(format!(
            "aggregate '{}' must also appear in SELECT",
            expr
        ))),
        Expr::Func { name, args } => Ok(Expr::Func {
            name: name.clone(),
            args: args
                .iter()
                .map(|a| rewrite_for_groups(a, query))
                .collect::<Result<Vec<_>>>()?,
        }),
        Expr::Ref(_) | Expr::Val(_) => Ok(expr.clone()),
    }
}

/// ORDER BY clauses of a grouped query, rewritten to read grouped rows.
pub fn grouped_order_by(query: &QueryIr) -> Result<Vec<OrderByClause>> {
    query
        .order_by
        .iter()
        .map(|c| Ok(OrderByClause::new(rewrite_for_groups(&c.expression, query)?, c.compare.clone())))
        .collect()
}

fn selected_name(expr: &Expr, query: &QueryIr) -> Option<String> {
    if matches!(expr, Expr::Val(_)) {
        return None;
    }
    match &query.select {
        Some(select) => find_in_select(select, expr),
        None => query.group_by.iter().position(|g| g == expr).map(key_field),
    }
}

fn find_in_select(select: &Select, expr: &Expr) -> Option<String> {
    select.iter().find(|(_, e)| e == expr).map(|(name, _)| name.clone())
}
