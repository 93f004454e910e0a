//! Predicate algebra over WHERE expressions.
//!
//! Used to decide whether data loaded for one request already covers another
//! request, and to narrow requests down to what has not been loaded yet. All
//! answers are conservative: "not a subset" and "no simplification" are always
//! safe.

use crate::ast::{Expr, OrderByClause, PropRef};
use crate::eval::{compare_scalars, values_equal};
use crate::load::LoadSubsetOptions;
use alloc::string::String;
use alloc::vec::Vec;
use core::cmp::Ordering;
use rill_core::Value;

/// True if every row matching `subset` also matches `superset`.
///
/// A missing predicate matches everything.
pub fn is_where_subset(subset: Option<&Expr>, superset: Option<&Expr>) -> bool {
    match (subset, superset) {
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(sub), Some(sup)) => where_subset(sub, sup),
    }
}

fn where_subset(subset: &Expr, superset: &Expr) -> bool {
    if matches!(subset, Expr::Val(Value::Boolean(false))) {
        return true;
    }
    if are_expressions_equal(subset, superset) {
        return true;
    }
    if let Some(args) = superset.func_args("and") {
        return args.iter().all(|arg| where_subset(subset, arg));
    }
    if let Some(args) = subset.func_args("and") {
        return args.iter().any(|arg| where_subset(arg, superset));
    }
    if let Some((r, values)) = in_field(subset) {
        return where_subset(&in_to_or(r, values), superset);
    }
    if let Some((r, values)) = in_field(superset) {
        return where_subset(subset, &in_to_or(r, values));
    }
    if let Some(args) = subset.func_args("or") {
        return args.iter().all(|arg| where_subset(arg, superset));
    }
    if let Some(args) = superset.func_args("or") {
        return args.iter().any(|arg| where_subset(subset, arg));
    }
    match (comparison_field(subset), comparison_field(superset)) {
        (Some(sub), Some(sup)) if sub.field == sup.field => comparison_subset(&sub, &sup),
        _ => false,
    }
}

fn in_to_or(field: &PropRef, values: &[Value]) -> Expr {
    match values.len() {
        0 => Expr::val(false),
        1 => Expr::eq(Expr::Ref(field.clone()), Expr::Val(values[0].clone())),
        _ => Expr::or(
            values
                .iter()
                .map(|v| Expr::eq(Expr::Ref(field.clone()), Expr::Val(v.clone())))
                .collect(),
        ),
    }
}

/// `field <op> literal` with op one of eq, gt, gte, lt, lte.
struct Comparison<'a> {
    op: &'a str,
    field: &'a PropRef,
    value: &'a Value,
}

fn comparison_field(expr: &Expr) -> Option<Comparison<'_>> {
    let op = expr.name().filter(|n| matches!(*n, "eq" | "gt" | "gte" | "lt" | "lte"))?;
    if !matches!(expr, Expr::Func { .. }) {
        return None;
    }
    match expr.args() {
        [Expr::Ref(field), Expr::Val(value)] => Some(Comparison { op, field, value }),
        _ => None,
    }
}

fn in_field(expr: &Expr) -> Option<(&PropRef, &[Value])> {
    match expr.func_args("in")? {
        [Expr::Ref(field), Expr::Val(Value::Array(values))] => Some((field, values)),
        _ => None,
    }
}

fn cmp(a: &Value, b: &Value) -> Option<Ordering> {
    compare_scalars(a, b)
}

fn comparison_subset(sub: &Comparison<'_>, sup: &Comparison<'_>) -> bool {
    use Ordering::*;
    let Some(ord) = cmp(sub.value, sup.value) else {
        return sub.op == "eq" && sup.op == "eq" && values_equal(sub.value, sup.value);
    };
    match (sub.op, sup.op) {
        ("eq", "eq") => values_equal(sub.value, sup.value),
        ("gt", "gt") | ("gte", "gte") | ("gt", "gte") => ord != Less,
        ("lt", "lt") | ("lte", "lte") | ("lt", "lte") => ord != Greater,
        ("eq", "gt") | ("gte", "gt") => ord == Greater,
        ("eq", "gte") => ord != Less,
        ("eq", "lt") | ("lte", "lt") => ord == Less,
        ("eq", "lte") => ord != Greater,
        _ => false,
    }
}

/// Structural equality of two expressions.
///
/// Numbers compare by value, so `1` and `1.0` are equal literals.
pub fn are_expressions_equal(a: &Expr, b: &Expr) -> bool {
    match (a, b) {
        (Expr::Val(l), Expr::Val(r)) => values_equal(l, r),
        (Expr::Ref(l), Expr::Ref(r)) => l == r,
        (Expr::Func { name: ln, args: la }, Expr::Func { name: rn, args: ra })
        | (Expr::Agg { name: ln, args: la }, Expr::Agg { name: rn, args: ra }) => {
            ln == rn
                && la.len() == ra.len()
                && la.iter().zip(ra).all(|(l, r)| are_expressions_equal(l, r))
        }
        _ => false,
    }
}

/// The disjunction of several predicates, simplified per field.
///
/// Range bounds on the same field keep only the loosest bound, and equality
/// or IN clauses on the same field merge into one IN list. An empty input
/// yields `false`.
pub fn union_where_predicates(predicates: &[Expr]) -> Expr {
    match predicates {
        [] => return Expr::val(false),
        [single] => return single.clone(),
        _ => {}
    }
    let mut flat: Vec<&Expr> = Vec::new();
    for p in predicates {
        match p.func_args("or") {
            Some(args) => flat.extend(args.iter()),
            None => flat.push(p),
        }
    }

    // Group by field path, keeping first-seen order.
    let mut groups: Vec<(Option<String>, Vec<&Expr>)> = Vec::new();
    for p in flat {
        let key = field_key(p);
        match groups.iter_mut().find(|(k, _)| *k == key && key.is_some()) {
            Some((_, members)) => members.push(p),
            None => groups.push((key, alloc::vec![p])),
        }
    }

    let mut simplified = Vec::new();
    for (key, members) in groups {
        if key.is_none() {
            simplified.extend(members.into_iter().cloned());
        } else {
            simplified.push(union_same_field(&members));
        }
    }
    match simplified.len() {
        0 => Expr::val(false),
        1 => simplified.remove(0),
        _ => Expr::or(simplified),
    }
}

fn field_key(expr: &Expr) -> Option<String> {
    let field = comparison_field(expr)
        .map(|c| c.field)
        .or_else(|| in_field(expr).map(|(f, _)| f))?;
    Some(field.path.join("."))
}

fn union_same_field(members: &[&Expr]) -> Expr {
    if members.len() == 1 {
        return members[0].clone();
    }
    let mut lower: Option<(&Expr, &Value, bool)> = None; // (clause, bound, inclusive)
    let mut upper: Option<(&Expr, &Value, bool)> = None;
    let mut point_values: Vec<Value> = Vec::new();
    let mut field: Option<&PropRef> = None;
    let mut others: Vec<Expr> = Vec::new();

    for &m in members {
        if let Some(c) = comparison_field(m) {
            field = Some(c.field);
            match c.op {
                "gt" | "gte" => {
                    let inclusive = c.op == "gte";
                    let looser = match lower {
                        None => true,
                        Some((_, bound, incl)) => match cmp(c.value, bound) {
                            Some(Ordering::Less) => true,
                            Some(Ordering::Equal) => inclusive && !incl,
                            Some(Ordering::Greater) => false,
                            None => {
                                others.push(m.clone());
                                continue;
                            }
                        },
                    };
                    if looser {
                        lower = Some((m, c.value, inclusive));
                    }
                }
                "lt" | "lte" => {
                    let inclusive = c.op == "lte";
                    let looser = match upper {
                        None => true,
                        Some((_, bound, incl)) => match cmp(c.value, bound) {
                            Some(Ordering::Greater) => true,
                            Some(Ordering::Equal) => inclusive && !incl,
                            Some(Ordering::Less) => false,
                            None => {
                                others.push(m.clone());
                                continue;
                            }
                        },
                    };
                    if looser {
                        upper = Some((m, c.value, inclusive));
                    }
                }
                _ => push_unique(&mut point_values, c.value),
            }
        } else if let Some((f, values)) = in_field(m) {
            field = Some(f);
            for v in values {
                push_unique(&mut point_values, v);
            }
        } else {
            others.push(m.clone());
        }
    }

    let mut result = Vec::new();
    if let Some((clause, _, _)) = lower {
        result.push(clause.clone());
    }
    if let Some((clause, _, _)) = upper {
        result.push(clause.clone());
    }
    match (point_values.len(), field) {
        (0, _) | (_, None) => {}
        (1, Some(f)) => result.push(Expr::eq(Expr::Ref(f.clone()), Expr::Val(point_values.remove(0)))),
        (_, Some(f)) => result.push(Expr::in_list(Expr::Ref(f.clone()), point_values)),
    }
    result.extend(others);
    match result.len() {
        0 => Expr::val(true),
        1 => result.remove(0),
        _ => Expr::or(result),
    }
}

fn push_unique(values: &mut Vec<Value>, v: &Value) {
    if !values.iter().any(|x| values_equal(x, v)) {
        values.push(v.clone());
    }
}

/// The rows matching `from` but not `subtract`, when expressible.
///
/// Returns `None` when no simplified difference is known; callers then fall
/// back to `from` unchanged.
pub fn minus_where_predicates(from: Option<&Expr>, subtract: Option<&Expr>) -> Option<Expr> {
    let Some(subtract) = subtract else {
        return Some(from.cloned().unwrap_or_else(|| Expr::val(true)));
    };
    let Some(from) = from else {
        return Some(Expr::not(subtract.clone()));
    };
    if where_subset(from, subtract) {
        return Some(Expr::val(false));
    }

    let common = common_conditions(from, subtract);
    if !common.is_empty() {
        let from_rest = remove_conditions(from, &common);
        let subtract_rest = remove_conditions(subtract, &common);
        if let Some(diff) = minus_where_predicates(from_rest.as_ref(), subtract_rest.as_ref()) {
            let mut all = common;
            all.push(diff);
            return Some(combine_conditions(all));
        }
    }

    minus_same_field(from, subtract)
}

fn conditions(expr: &Expr) -> Vec<&Expr> {
    match expr.func_args("and") {
        Some(args) => args.iter().flat_map(conditions).collect(),
        None => alloc::vec![expr],
    }
}

fn common_conditions(a: &Expr, b: &Expr) -> Vec<Expr> {
    let right = conditions(b);
    let mut common: Vec<Expr> = Vec::new();
    for c in conditions(a) {
        if right.iter().any(|r| are_expressions_equal(c, r))
            && !common.iter().any(|x| are_expressions_equal(x, c))
        {
            common.push(c.clone());
        }
    }
    common
}

fn remove_conditions(expr: &Expr, remove: &[Expr]) -> Option<Expr> {
    let Some(args) = expr.func_args("and") else {
        return Some(expr.clone());
    };
    let mut rest: Vec<Expr> = args
        .iter()
        .filter(|a| !remove.iter().any(|r| are_expressions_equal(a, r)))
        .cloned()
        .collect();
    match rest.len() {
        0 => None,
        1 => Some(rest.remove(0)),
        _ => Some(Expr::and(rest)),
    }
}

fn combine_conditions(conditions: Vec<Expr>) -> Expr {
    let mut flat = Vec::new();
    for c in conditions {
        match c {
            Expr::Func { ref name, ref args } if name == "and" => flat.extend(args.iter().cloned()),
            other => flat.push(other),
        }
    }
    match flat.len() {
        0 => Expr::val(true),
        1 => flat.remove(0),
        _ => Expr::and(flat),
    }
}

fn point_set(expr: &Expr) -> Option<(&PropRef, Vec<&Value>)> {
    if let Some((f, values)) = in_field(expr) {
        return Some((f, values.iter().collect()));
    }
    comparison_field(expr)
        .filter(|c| c.op == "eq")
        .map(|c| (c.field, alloc::vec![c.value]))
}

fn minus_same_field(from: &Expr, subtract: &Expr) -> Option<Expr> {
    // IN / eq against IN / eq: remove the subtracted points.
    if let (Some((field, from_values)), Some((sub_field, sub_values))) = (point_set(from), point_set(subtract)) {
        if field != sub_field {
            return None;
        }
        if from.name() == Some("eq") && subtract.name() == Some("in") {
            // Handled by the subset check above when the value is listed.
            return Some(from.clone());
        }
        let mut remaining: Vec<Value> = from_values
            .into_iter()
            .filter(|v| !sub_values.iter().any(|s| values_equal(v, s)))
            .cloned()
            .collect();
        return Some(match remaining.len() {
            0 => Expr::val(false),
            1 => Expr::eq(Expr::Ref(field.clone()), Expr::Val(remaining.remove(0))),
            _ => Expr::in_list(Expr::Ref(field.clone()), remaining),
        });
    }

    let (f, s) = (comparison_field(from)?, comparison_field(subtract)?);
    if f.field != s.field {
        return None;
    }
    minus_range(from, &f, &s)
}

fn minus_range(from: &Expr, f: &Comparison<'_>, s: &Comparison<'_>) -> Option<Expr> {
    let ord = cmp(f.value, s.value)?;
    let bound = |op: &str| Expr::func(op, alloc::vec![Expr::Ref(f.field.clone()), Expr::Val(s.value.clone())]);
    let lower_cut = |op: &str| Some(Expr::and(alloc::vec![from.clone(), bound(op)]));
    let upper_cut = |op: &str| Some(Expr::and(alloc::vec![bound(op), from.clone()]));
    match (f.op, s.op) {
        ("gt", "gt") if ord == Ordering::Less => lower_cut("lte"),
        ("gte", "gte") if ord == Ordering::Less => lower_cut("lt"),
        ("gt", "gte") if ord == Ordering::Less => lower_cut("lt"),
        ("gte", "gt") if ord != Ordering::Greater => lower_cut("lte"),
        ("lt", "lt") if ord == Ordering::Greater => upper_cut("gte"),
        ("lte", "lte") if ord == Ordering::Greater => upper_cut("gt"),
        ("lt", "lte") if ord == Ordering::Greater => upper_cut("gt"),
        ("lte", "lt") if ord != Ordering::Less => upper_cut("gte"),
        ("gt" | "gte", "gt" | "gte") | ("lt" | "lte", "lt" | "lte") => Some(from.clone()),
        _ => None,
    }
}

/// True if `subset` ordering is a prefix of `superset` ordering.
///
/// Only directions are compared among the compare options.
pub fn is_order_by_subset(subset: &[OrderByClause], superset: &[OrderByClause]) -> bool {
    if subset.is_empty() {
        return true;
    }
    if superset.is_empty() || subset.len() > superset.len() {
        return false;
    }
    subset.iter().zip(superset).all(|(sub, sup)| {
        are_expressions_equal(&sub.expression, &sup.expression)
            && sub.compare.direction == sup.compare.direction
    })
}

/// True if a `subset` limit fits within a `superset` limit. `None` is unlimited.
pub fn is_limit_subset(subset: Option<usize>, superset: Option<usize>) -> bool {
    match (subset, superset) {
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(sub), Some(sup)) => sub <= sup,
    }
}

/// True if the `[offset, offset + limit)` window of `subset` lies within that of `superset`.
pub fn is_offset_limit_subset(subset: &LoadSubsetOptions, superset: &LoadSubsetOptions) -> bool {
    let sub_offset = subset.offset.unwrap_or(0);
    let sup_offset = superset.offset.unwrap_or(0);
    if sup_offset > sub_offset {
        return false;
    }
    match (subset.limit, superset.limit) {
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(sub), Some(sup)) => sub_offset + sub <= sup_offset + sup,
    }
}

/// True if data loaded for `superset` is guaranteed to contain everything `subset` asks for.
///
/// Limited requests only cover requests with a structurally equal predicate:
/// the top rows of a narrower predicate may lie outside the top rows of a
/// broader one.
pub fn is_predicate_subset(subset: &LoadSubsetOptions, superset: &LoadSubsetOptions) -> bool {
    let where_ok = if superset.limit.is_some() {
        match (&subset.where_expr, &superset.where_expr) {
            (None, None) => true,
            (Some(a), Some(b)) => are_expressions_equal(a, b),
            _ => false,
        }
    } else {
        is_where_subset(subset.where_expr.as_ref(), superset.where_expr.as_ref())
    };
    where_ok
        && is_order_by_subset(&subset.order_by, &superset.order_by)
        && is_offset_limit_subset(subset, superset)
}
