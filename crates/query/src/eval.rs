//! Expression evaluation.
//!
//! Expressions are compiled once into closures over a namespaced row (an
//! object mapping each source alias to its row). Comparisons involving null
//! yield null, and `and`/`or`/`not` follow three-valued logic; a filter keeps
//! a row only when its predicate evaluates to `true`.

use crate::ast::{CompareOptions, Direction, Expr, Nulls, OrderByClause, StringSort};
use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::cmp::Ordering;
use rill_core::pattern_match::{ilike, like};
use rill_core::{Error, Result, Value};

/// A compiled expression.
pub type CompiledExpr = Rc<dyn Fn(&Value) -> Value>;

/// A compiled boolean expression.
pub type CompiledPredicate = Rc<dyn Fn(&Value) -> bool>;

/// Operators understood by the evaluator.
pub const SUPPORTED_OPERATORS: &[&str] = &[
    "eq",
    "gt",
    "gte",
    "lt",
    "lte",
    "in",
    "and",
    "or",
    "not",
    "isNull",
    "isUndefined",
    "like",
    "ilike",
    "upper",
    "lower",
    "length",
    "concat",
    "add",
    "coalesce",
];

/// Compiles an expression into a closure.
pub fn compile_expression(expr: &Expr) -> Result<CompiledExpr> {
    Ok(match expr {
        Expr::Ref(r) => {
            let path = r.path.clone();
            Rc::new(move |row: &Value| row.get_path(path.as_slice()).cloned().unwrap_or(Value::Null))
        }
        Expr::Val(v) => {
            let v = v.clone();
            Rc::new(move |_: &Value| v.clone())
        }
        Expr::Agg { name, .. } => {
            return Err(Error::unsupported(alloc::format!(
                "aggregate '{}' outside GROUP BY",
                name
            )))
        }
        Expr::Func { name, args } => {
            let args = args
                .iter()
                .map(compile_expression)
                .collect::<Result<Vec<_>>>()?;
            compile_func(name, args)?
        }
    })
}

/// Compiles a boolean expression into a row filter.
pub fn compile_predicate(expr: &Expr) -> Result<CompiledPredicate> {
    let compiled = compile_expression(expr)?;
    Ok(Rc::new(move |row: &Value| compiled(row).is_true()))
}

fn arg(args: &[CompiledExpr], i: usize, row: &Value) -> Value {
    args.get(i).map(|a| a(row)).unwrap_or(Value::Null)
}

fn compile_func(name: &str, args: Vec<CompiledExpr>) -> Result<CompiledExpr> {
    let f: Box<dyn Fn(&[CompiledExpr], &Value) -> Value> = match name {
        "eq" => Box::new(|a: &[CompiledExpr], row: &Value| {
            let (l, r) = (arg(a, 0, row), arg(a, 1, row));
            if l.is_null() || r.is_null() {
                return Value::Null;
            }
            Value::Boolean(values_equal(&l, &r))
        }),
        "gt" => comparison(|o| o == Ordering::Greater),
        "gte" => comparison(|o| o != Ordering::Less),
        "lt" => comparison(|o| o == Ordering::Less),
        "lte" => comparison(|o| o != Ordering::Greater),
        "in" => Box::new(|a: &[CompiledExpr], row: &Value| {
            let v = arg(a, 0, row);
            if v.is_null() {
                return Value::Null;
            }
            match arg(a, 1, row) {
                Value::Array(items) => Value::Boolean(items.iter().any(|i| values_equal(&v, i))),
                _ => Value::Boolean(false),
            }
        }),
        "and" => Box::new(|a: &[CompiledExpr], row: &Value| {
            let mut unknown = false;
            for e in a {
                match truth(&e(row)) {
                    Some(false) => return Value::Boolean(false),
                    None => unknown = true,
                    Some(true) => {}
                }
            }
            if unknown {
                Value::Null
            } else {
                Value::Boolean(true)
            }
        }),
        "or" => Box::new(|a: &[CompiledExpr], row: &Value| {
            let mut unknown = false;
            for e in a {
                match truth(&e(row)) {
                    Some(true) => return Value::Boolean(true),
                    None => unknown = true,
                    Some(false) => {}
                }
            }
            if unknown {
                Value::Null
            } else {
                Value::Boolean(false)
            }
        }),
        "not" => Box::new(|a: &[CompiledExpr], row: &Value| match truth(&arg(a, 0, row)) {
            Some(b) => Value::Boolean(!b),
            None => Value::Null,
        }),
        // Absent fields read as null, so both checks coincide.
        "isNull" | "isUndefined" => Box::new(|a: &[CompiledExpr], row: &Value| {
            Value::Boolean(arg(a, 0, row).is_null())
        }),
        "like" => pattern(like),
        "ilike" => pattern(ilike),
        "upper" => Box::new(|a: &[CompiledExpr], row: &Value| match arg(a, 0, row) {
            Value::String(s) => Value::String(s.to_uppercase()),
            other => other,
        }),
        "lower" => Box::new(|a: &[CompiledExpr], row: &Value| match arg(a, 0, row) {
            Value::String(s) => Value::String(s.to_lowercase()),
            other => other,
        }),
        "length" => Box::new(|a: &[CompiledExpr], row: &Value| match arg(a, 0, row) {
            Value::String(s) => Value::Int64(s.chars().count() as i64),
            Value::Array(items) => Value::Int64(items.len() as i64),
            _ => Value::Null,
        }),
        "concat" => Box::new(|a: &[CompiledExpr], row: &Value| {
            let mut out = String::new();
            for e in a {
                match e(row) {
                    Value::Null => {}
                    Value::String(s) => out.push_str(&s),
                    other => out.push_str(&other.to_string()),
                }
            }
            Value::String(out)
        }),
        "add" => Box::new(|a: &[CompiledExpr], row: &Value| match (arg(a, 0, row), arg(a, 1, row)) {
            (Value::Int64(l), Value::Int64(r)) => l
                .checked_add(r)
                .map(Value::Int64)
                .unwrap_or(Value::Float64(l as f64 + r as f64)),
            (l, r) => match (l.as_f64(), r.as_f64()) {
                (Some(l), Some(r)) => Value::Float64(l + r),
                _ => Value::Null,
            },
        }),
        "coalesce" => Box::new(|a: &[CompiledExpr], row: &Value| {
            a.iter()
                .map(|e| e(row))
                .find(|v| !v.is_null())
                .unwrap_or(Value::Null)
        }),
        _ => {
            return Err(Error::unknown_operator(
                name,
                SUPPORTED_OPERATORS.iter().map(|s| s.to_string()).collect(),
            ))
        }
    };
    Ok(Rc::new(move |row: &Value| f(&args, row)))
}

fn comparison(accept: fn(Ordering) -> bool) -> Box<dyn Fn(&[CompiledExpr], &Value) -> Value> {
    Box::new(move |a: &[CompiledExpr], row: &Value| {
        let (l, r) = (arg(a, 0, row), arg(a, 1, row));
        if l.is_null() || r.is_null() {
            return Value::Null;
        }
        Value::Boolean(compare_scalars(&l, &r).map(accept).unwrap_or(false))
    })
}

fn pattern(matcher: fn(&str, &str) -> bool) -> Box<dyn Fn(&[CompiledExpr], &Value) -> Value> {
    Box::new(move |a: &[CompiledExpr], row: &Value| match (arg(a, 0, row), arg(a, 1, row)) {
        (Value::String(s), Value::String(p)) => Value::Boolean(matcher(&s, &p)),
        (Value::Null, _) | (_, Value::Null) => Value::Null,
        _ => Value::Boolean(false),
    })
}

/// Three-valued truth: null is unknown, any other non-boolean is true.
fn truth(v: &Value) -> Option<bool> {
    match v {
        Value::Null => None,
        Value::Boolean(b) => Some(*b),
        _ => Some(true),
    }
}

/// Equality with numbers compared by value across integer and float.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int64(_), Value::Float64(_)) | (Value::Float64(_), Value::Int64(_)) => {
            a.as_f64() == b.as_f64()
        }
        _ => a == b,
    }
}

/// Orders two non-null scalars of compatible types.
///
/// Returns `None` for values of different kinds (a string and a number).
pub fn compare_scalars(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Int64(l), Value::Int64(r)) => Some(l.cmp(r)),
        _ if a.is_numeric() && b.is_numeric() => {
            let (l, r) = (a.as_f64()?, b.as_f64()?);
            l.partial_cmp(&r).or(Some(a.cmp(b)))
        }
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        (Value::Boolean(l), Value::Boolean(r)) => Some(l.cmp(r)),
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Compares two ORDER BY keys under the given options.
///
/// Null placement is independent of the direction.
pub fn compare_values(a: &Value, b: &Value, options: &CompareOptions) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => return Ordering::Equal,
        (true, false) => {
            return match options.nulls {
                Nulls::First => Ordering::Less,
                Nulls::Last => Ordering::Greater,
            }
        }
        (false, true) => {
            return match options.nulls {
                Nulls::First => Ordering::Greater,
                Nulls::Last => Ordering::Less,
            }
        }
        (false, false) => {}
    }
    let ordering = match (a, b, options.string_sort) {
        (Value::String(l), Value::String(r), StringSort::Locale) => l
            .to_lowercase()
            .cmp(&r.to_lowercase())
            .then_with(|| l.cmp(r)),
        _ => compare_scalars(a, b).unwrap_or_else(|| a.cmp(b)),
    };
    match options.direction {
        Direction::Asc => ordering,
        Direction::Desc => ordering.reverse(),
    }
}

/// Compiles ORDER BY clauses into a key extractor.
///
/// A single clause yields its value directly; several yield an array.
pub fn compile_order_by(clauses: &[OrderByClause]) -> Result<CompiledExpr> {
    let compiled = clauses
        .iter()
        .map(|c| compile_expression(&c.expression))
        .collect::<Result<Vec<_>>>()?;
    Ok(match compiled.len() {
        1 => compiled[0].clone(),
        _ => Rc::new(move |row: &Value| Value::Array(compiled.iter().map(|c| c(row)).collect())),
    })
}

/// Comparator over keys produced by `compile_order_by`.
pub fn order_by_comparator(clauses: &[OrderByClause]) -> Rc<dyn Fn(&Value, &Value) -> Ordering> {
    let options: Vec<CompareOptions> = clauses.iter().map(|c| c.compare.clone()).collect();
    if options.len() == 1 {
        let opts = options[0].clone();
        return Rc::new(move |a, b| compare_values(a, b, &opts));
    }
    Rc::new(move |a, b| match (a, b) {
        (Value::Array(l), Value::Array(r)) => {
            for (i, opts) in options.iter().enumerate() {
                let ord = compare_values(
                    l.get(i).unwrap_or(&Value::Null),
                    r.get(i).unwrap_or(&Value::Null),
                    opts,
                );
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            l.len().cmp(&r.len())
        }
        _ => a.cmp(b),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> Value {
        Value::object([(
            "u",
            Value::object([
                ("id", Value::Int64(1)),
                ("name", Value::from("Alice")),
                ("age", Value::Int64(30)),
                ("score", Value::Float64(2.5)),
                ("email", Value::Null),
            ]),
        )])
    }

    fn eval(expr: &Expr) -> Value {
        compile_expression(expr).unwrap()(&row())
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(eval(&Expr::eq(Expr::field("u", "age"), Expr::val(30i64))), Value::Boolean(true));
        assert_eq!(eval(&Expr::gt(Expr::field("u", "age"), Expr::val(18i64))), Value::Boolean(true));
        assert_eq!(eval(&Expr::lte(Expr::field("u", "score"), Expr::val(2i64))), Value::Boolean(false));
        assert_eq!(eval(&Expr::eq(Expr::field("u", "score"), Expr::val(2.5))), Value::Boolean(true));
        assert_eq!(eval(&Expr::gt(Expr::field("u", "name"), Expr::val(1i64))), Value::Boolean(false));
    }

    #[test]
    fn test_null_comparisons_are_unknown() {
        assert_eq!(eval(&Expr::eq(Expr::field("u", "email"), Expr::val("x"))), Value::Null);
        assert_eq!(eval(&Expr::gt(Expr::field("u", "missing"), Expr::val(1i64))), Value::Null);
    }

    #[test]
    fn test_three_valued_logic() {
        let unknown = Expr::eq(Expr::field("u", "email"), Expr::val("x"));
        let yes = Expr::eq(Expr::field("u", "id"), Expr::val(1i64));
        let no = Expr::eq(Expr::field("u", "id"), Expr::val(2i64));

        assert_eq!(eval(&Expr::and(alloc::vec![unknown.clone(), no.clone()])), Value::Boolean(false));
        assert_eq!(eval(&Expr::and(alloc::vec![unknown.clone(), yes.clone()])), Value::Null);
        assert_eq!(eval(&Expr::or(alloc::vec![unknown.clone(), yes])), Value::Boolean(true));
        assert_eq!(eval(&Expr::or(alloc::vec![unknown.clone(), no])), Value::Null);
        assert_eq!(eval(&Expr::not(unknown.clone())), Value::Null);

        let keep = compile_predicate(&Expr::not(unknown)).unwrap();
        assert!(!keep(&row()));
    }

    #[test]
    fn test_in_and_null_checks() {
        let e = Expr::in_list(Expr::field("u", "id"), alloc::vec![Value::Int64(3), Value::Float64(1.0)]);
        assert_eq!(eval(&e), Value::Boolean(true));
        assert_eq!(eval(&Expr::is_null(Expr::field("u", "email"))), Value::Boolean(true));
        assert_eq!(eval(&Expr::is_undefined(Expr::field("u", "nope"))), Value::Boolean(true));
        assert_eq!(eval(&Expr::is_null(Expr::field("u", "id"))), Value::Boolean(false));
    }

    #[test]
    fn test_string_functions() {
        assert_eq!(eval(&Expr::upper(Expr::field("u", "name"))), Value::from("ALICE"));
        assert_eq!(eval(&Expr::length(Expr::field("u", "name"))), Value::Int64(5));
        assert_eq!(eval(&Expr::like(Expr::field("u", "name"), "Al%")), Value::Boolean(true));
        assert_eq!(eval(&Expr::ilike(Expr::field("u", "name"), "al%")), Value::Boolean(true));
        assert_eq!(
            eval(&Expr::concat(alloc::vec![Expr::field("u", "name"), Expr::val("-"), Expr::field("u", "id")])),
            Value::from("Alice-1")
        );
    }

    #[test]
    fn test_add_and_coalesce() {
        assert_eq!(eval(&Expr::add(Expr::field("u", "age"), Expr::val(1i64))), Value::Int64(31));
        assert_eq!(eval(&Expr::add(Expr::field("u", "age"), Expr::val(0.5))), Value::Float64(30.5));
        assert_eq!(
            eval(&Expr::coalesce(alloc::vec![Expr::field("u", "email"), Expr::val("n/a")])),
            Value::from("n/a")
        );
    }

    #[test]
    fn test_unknown_operator_and_aggregate_fail() {
        let err = compile_expression(&Expr::func("regexp", alloc::vec![])).err().unwrap();
        assert!(matches!(err, Error::UnknownOperator { ref operator, .. } if operator == "regexp"));
        assert!(compile_expression(&Expr::count(Expr::field("u", "id"))).is_err());
    }

    #[test]
    fn test_compare_values_options() {
        let asc = CompareOptions::asc();
        let desc = CompareOptions::desc();
        let nulls_last = CompareOptions::asc().with_nulls(Nulls::Last);

        assert_eq!(compare_values(&Value::Int64(1), &Value::Float64(1.5), &asc), Ordering::Less);
        assert_eq!(compare_values(&Value::Int64(1), &Value::Int64(2), &desc), Ordering::Greater);
        assert_eq!(compare_values(&Value::Null, &Value::Int64(2), &asc), Ordering::Less);
        assert_eq!(compare_values(&Value::Null, &Value::Int64(2), &desc), Ordering::Less);
        assert_eq!(compare_values(&Value::Null, &Value::Int64(2), &nulls_last), Ordering::Greater);

        let locale = CompareOptions::asc().with_locale("en");
        assert_eq!(compare_values(&Value::from("b"), &Value::from("C"), &locale), Ordering::Less);
        assert_eq!(compare_values(&Value::from("b"), &Value::from("C"), &asc), Ordering::Greater);
    }

    #[test]
    fn test_multi_clause_comparator() {
        let clauses = alloc::vec![
            OrderByClause::asc(Expr::field("u", "age")),
            OrderByClause::desc(Expr::field("u", "name")),
        ];
        let key = compile_order_by(&clauses).unwrap();
        let cmp = order_by_comparator(&clauses);
        let a = key(&row());
        let b = Value::Array(alloc::vec![Value::Int64(30), Value::from("Bob")]);
        assert_eq!(cmp(&a, &b), Ordering::Greater);
    }
}
