//! Helpers for translating IR expressions into a backend's filter syntax.
//!
//! Source adapters receive `LoadSubsetOptions` and usually need to turn the
//! predicate into query parameters, a GraphQL filter, SQL, and so on.
//! `parse_where_expression` walks the tree and calls one handler per operator;
//! `extract_simple_comparisons` covers the common case of AND-ed
//! `field <op> value` conditions and fails on anything else.

use crate::ast::{Direction, Expr, Nulls, OrderByClause, StringSort};
use crate::load::LoadSubsetOptions;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use rill_core::{Error, Result, Value};

/// Path of a field, without a source alias.
pub type FieldPath = Vec<String>;

/// Returns the path of a `Ref` expression.
pub fn extract_field_path(expr: &Expr) -> Option<&[String]> {
    expr.as_ref_path().map(|r| r.path.as_slice())
}

/// Returns the literal of a `Val` expression.
pub fn extract_value(expr: &Expr) -> Option<&Value> {
    expr.as_val()
}

/// Visits every node of an expression tree, parents before children.
pub fn walk_expression<F>(expr: Option<&Expr>, visitor: &mut F)
where
    F: FnMut(&Expr),
{
    let Some(expr) = expr else {
        return;
    };
    visitor(expr);
    for arg in expr.args() {
        walk_expression(Some(arg), visitor);
    }
}

/// An operator argument as seen by a handler.
#[derive(Clone, Debug, PartialEq)]
pub enum WhereArg<T> {
    /// A field reference.
    Field(FieldPath),
    /// A literal.
    Value(Value),
    /// A nested operator, already translated.
    Parsed(T),
}

pub type OperatorHandler<T> = Box<dyn Fn(Vec<WhereArg<T>>) -> Result<T>>;
pub type UnknownOperatorHandler<T> = Box<dyn Fn(&str, &[Expr]) -> Result<T>>;

/// Operator handlers for `parse_where_expression`.
pub struct ParseWhereOptions<T> {
    handlers: BTreeMap<String, OperatorHandler<T>>,
    on_unknown_operator: Option<UnknownOperatorHandler<T>>,
}

impl<T> Default for ParseWhereOptions<T> {
    fn default() -> Self {
        Self {
            handlers: BTreeMap::new(),
            on_unknown_operator: None,
        }
    }
}

impl<T> ParseWhereOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for an operator name (`eq`, `and`, `isNull`, ...).
    pub fn handler<F>(mut self, operator: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<WhereArg<T>>) -> Result<T> + 'static,
    {
        self.handlers.insert(operator.into(), Box::new(f));
        self
    }

    /// Fallback for operators without a handler.
    pub fn on_unknown_operator<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &[Expr]) -> Result<T> + 'static,
    {
        self.on_unknown_operator = Some(Box::new(f));
        self
    }
}

/// Translates an expression using per-operator handlers.
///
/// Bare references and literals are returned as `Field` and `Value`; operator
/// nodes are translated bottom-up and returned as `Parsed`. An operator with no
/// handler goes to the fallback, or fails with `Error::UnknownOperator`
/// listing the registered handlers.
pub fn parse_where_expression<T>(
    expr: Option<&Expr>,
    options: &ParseWhereOptions<T>,
) -> Result<Option<WhereArg<T>>> {
    let Some(expr) = expr else {
        return Ok(None);
    };
    parse_node(expr, options).map(Some)
}

fn parse_node<T>(expr: &Expr, options: &ParseWhereOptions<T>) -> Result<WhereArg<T>> {
    let (name, args) = match expr {
        Expr::Ref(r) => return Ok(WhereArg::Field(r.path.clone())),
        Expr::Val(v) => return Ok(WhereArg::Value(v.clone())),
        Expr::Func { name, args } | Expr::Agg { name, args } => (name, args),
    };
    let Some(handler) = options.handlers.get(name.as_str()) else {
        return match &options.on_unknown_operator {
            Some(fallback) => fallback(name, args).map(WhereArg::Parsed),
            None => Err(Error::unknown_operator(
                name.as_str(),
                options.handlers.keys().cloned().collect(),
            )),
        };
    };
    let parsed = args
        .iter()
        .map(|arg| parse_node(arg, options))
        .collect::<Result<Vec<_>>>()?;
    handler(parsed).map(WhereArg::Parsed)
}

/// An ORDER BY clause reduced to a field and its options.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedOrderBy {
    pub field: FieldPath,
    pub direction: Direction,
    pub nulls: Nulls,
    pub string_sort: StringSort,
    pub locale: Option<String>,
}

/// Reduces ORDER BY clauses to field paths. Clauses over computed
/// expressions are rejected.
pub fn parse_order_by_expression(order_by: &[OrderByClause]) -> Result<Vec<ParsedOrderBy>> {
    order_by
        .iter()
        .map(|clause| {
            let field = extract_field_path(&clause.expression).ok_or_else(|| {
                Error::unsupported_expression(format!(
                    "ORDER BY expression must be a field reference, got: {}",
                    clause.expression.kind()
                ))
            })?;
            Ok(ParsedOrderBy {
                field: field.to_vec(),
                direction: clause.compare.direction,
                nulls: clause.compare.nulls,
                string_sort: clause.compare.string_sort,
                locale: clause.compare.locale.clone(),
            })
        })
        .collect()
}

/// A `field <operator> value` condition.
#[derive(Clone, Debug, PartialEq)]
pub struct SimpleComparison {
    pub field: FieldPath,
    /// `eq`, `gt`, `gte`, `lt`, `lte`, `in`, `isNull`, `isUndefined`, or
    /// one of these prefixed with `not_`.
    pub operator: String,
    /// Absent for null checks.
    pub value: Option<Value>,
}

const COMPARISON_OPS: &[&str] = &["eq", "gt", "gte", "lt", "lte", "in"];
const NULL_CHECK_OPS: &[&str] = &["isNull", "isUndefined"];
const UNSUPPORTED_OPS: &[&str] = &[
    "or", "like", "ilike", "upper", "lower", "length", "concat", "add", "coalesce", "count",
    "avg", "sum", "min", "max",
];

/// Flattens an AND-only predicate into simple comparisons.
///
/// `not(op(field, value))` becomes the operator `not_op`. Any other construct
/// (OR, string functions, aggregates, comparisons between two fields, unknown
/// operators) is an error rather than being dropped.
pub fn extract_simple_comparisons(expr: Option<&Expr>) -> Result<Vec<SimpleComparison>> {
    let mut out = Vec::new();
    if let Some(expr) = expr {
        extract_into(expr, &mut out)?;
    }
    Ok(out)
}

fn extract_into(expr: &Expr, out: &mut Vec<SimpleComparison>) -> Result<()> {
    let Some(name) = expr.name() else {
        return Ok(());
    };
    let args = expr.args();
    if name == "and" {
        for arg in args {
            extract_into(arg, out)?;
        }
        return Ok(());
    }
    if name == "not" {
        let inner = match args.first() {
            Some(inner @ Expr::Func { .. }) => inner,
            _ => {
                return Err(Error::unsupported_expression(
                    "extractSimpleComparisons requires a comparison or null check inside 'not' operator.",
                ))
            }
        };
        let inner_name = inner.name().unwrap_or_default();
        if NULL_CHECK_OPS.contains(&inner_name) {
            out.push(null_check(inner_name, inner.args(), "not_")?);
            return Ok(());
        }
        if COMPARISON_OPS.contains(&inner_name) {
            out.push(comparison(inner_name, inner.args(), "not_")?);
            return Ok(());
        }
        return Err(Error::unsupported_expression(format!(
            "extractSimpleComparisons does not support 'not({})'. NOT can only wrap comparison operators (eq, gt, gte, lt, lte, in) or null checks (isNull, isUndefined).",
            inner_name
        )));
    }
    if UNSUPPORTED_OPS.contains(&name) {
        return Err(Error::unsupported_expression(format!(
            "extractSimpleComparisons does not support '{}' operator. Use parseWhereExpression with custom handlers for complex expressions.",
            name
        )));
    }
    if NULL_CHECK_OPS.contains(&name) {
        out.push(null_check(name, args, "")?);
        return Ok(());
    }
    if COMPARISON_OPS.contains(&name) {
        out.push(comparison(name, args, "")?);
        return Ok(());
    }
    Err(Error::unsupported_expression(format!(
        "extractSimpleComparisons encountered unknown operator: '{}'",
        name
    )))
}

fn null_check(name: &str, args: &[Expr], prefix: &str) -> Result<SimpleComparison> {
    let field = args.first().and_then(extract_field_path).ok_or_else(|| {
        Error::unsupported_expression(format!(
            "extractSimpleComparisons requires a field reference for '{}' operator.",
            name
        ))
    })?;
    Ok(SimpleComparison {
        field: field.to_vec(),
        operator: format!("{}{}", prefix, name),
        value: None,
    })
}

fn comparison(name: &str, args: &[Expr], prefix: &str) -> Result<SimpleComparison> {
    match args {
        [Expr::Ref(field), Expr::Val(value)] => Ok(SimpleComparison {
            field: field.path.clone(),
            operator: format!("{}{}", prefix, name),
            value: Some(value.clone()),
        }),
        _ => {
            let shown = if prefix.is_empty() {
                String::from(name)
            } else {
                format!("not({})", name)
            };
            Err(Error::unsupported_expression(format!(
                "extractSimpleComparisons requires simple field-value comparisons. Found complex expression for '{}' operator.",
                shown
            )))
        }
    }
}

/// `LoadSubsetOptions` reduced to simple filters, sorts and a limit.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedLoadSubsetOptions {
    pub filters: Vec<SimpleComparison>,
    pub sorts: Vec<ParsedOrderBy>,
    pub limit: Option<usize>,
}

/// Parses subset-load options with `extract_simple_comparisons` and
/// `parse_order_by_expression`.
pub fn parse_load_subset_options(options: Option<&LoadSubsetOptions>) -> Result<ParsedLoadSubsetOptions> {
    let Some(options) = options else {
        return Ok(ParsedLoadSubsetOptions::default());
    };
    Ok(ParsedLoadSubsetOptions {
        filters: extract_simple_comparisons(options.where_expr.as_ref())?,
        sorts: parse_order_by_expression(&options.order_by)?,
        limit: options.limit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::CompareOptions;
    use alloc::string::ToString;

    fn status() -> Expr {
        Expr::reference(["status"])
    }

    fn age() -> Expr {
        Expr::reference(["age"])
    }

    #[test]
    fn test_walk_visits_every_node() {
        let e = Expr::and(alloc::vec![
            Expr::eq(status(), Expr::val("a")),
            Expr::not(Expr::is_null(age())),
        ]);
        let mut names = Vec::new();
        walk_expression(Some(&e), &mut |node: &Expr| names.push(node.kind()));
        assert_eq!(names, ["func", "func", "ref", "val", "func", "func", "ref"]);

        let mut count = 0;
        walk_expression(None, &mut |_: &Expr| count += 1);
        assert_eq!(count, 0);
    }

    fn query_string_options() -> ParseWhereOptions<String> {
        fn text(arg: &WhereArg<String>) -> String {
            match arg {
                WhereArg::Field(path) => path.join("."),
                WhereArg::Value(v) => v.to_string(),
                WhereArg::Parsed(s) => s.clone(),
            }
        }
        ParseWhereOptions::new()
            .handler("eq", |args: Vec<WhereArg<String>>| Ok(format!("{}={}", text(&args[0]), text(&args[1]))))
            .handler("gt", |args: Vec<WhereArg<String>>| Ok(format!("{}>{}", text(&args[0]), text(&args[1]))))
            .handler("and", |args: Vec<WhereArg<String>>| {
                Ok(args.iter().map(text).collect::<Vec<_>>().join("&"))
            })
    }

    #[test]
    fn test_parse_where_with_handlers() {
        let e = Expr::and(alloc::vec![
            Expr::eq(status(), Expr::val("active")),
            Expr::gt(age(), Expr::val(18i64)),
        ]);
        let parsed = parse_where_expression(Some(&e), &query_string_options()).unwrap();
        assert_eq!(parsed, Some(WhereArg::Parsed(String::from("status=active&age>18"))));
        assert_eq!(parse_where_expression(None, &query_string_options()).unwrap(), None);
    }

    #[test]
    fn test_parse_where_unknown_operator() {
        let e = Expr::like(status(), "a%");
        let err = parse_where_expression(Some(&e), &query_string_options()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "No handler provided for operator: like. Available handlers: and, eq, gt"
        );

        let options = query_string_options()
            .on_unknown_operator(|name: &str, _args: &[Expr]| Ok(format!("<{}>", name)));
        let parsed = parse_where_expression(Some(&e), &options).unwrap();
        assert_eq!(parsed, Some(WhereArg::Parsed(String::from("<like>"))));
    }

    #[test]
    fn test_parse_order_by() {
        let clauses = alloc::vec![
            OrderByClause::desc(age()),
            OrderByClause::new(status(), CompareOptions::asc().with_locale("de")),
        ];
        let parsed = parse_order_by_expression(&clauses).unwrap();
        assert_eq!(parsed[0].field, ["age"]);
        assert_eq!(parsed[0].direction, Direction::Desc);
        assert_eq!(parsed[1].string_sort, StringSort::Locale);
        assert_eq!(parsed[1].locale.as_deref(), Some("de"));

        let computed = alloc::vec![OrderByClause::asc(Expr::upper(status()))];
        let err = parse_order_by_expression(&computed).unwrap_err();
        assert_eq!(err.to_string(), "ORDER BY expression must be a field reference, got: func");
    }

    #[test]
    fn test_extract_simple_comparisons() {
        let e = Expr::and(alloc::vec![
            Expr::eq(status(), Expr::val("active")),
            Expr::and(alloc::vec![
                Expr::gte(age(), Expr::val(18i64)),
                Expr::not(Expr::in_list(status(), alloc::vec![Value::from("banned")])),
            ]),
            Expr::not(Expr::is_null(Expr::reference(["email"]))),
        ]);
        let got = extract_simple_comparisons(Some(&e)).unwrap();
        let ops: Vec<&str> = got.iter().map(|c| c.operator.as_str()).collect();
        assert_eq!(ops, ["eq", "gte", "not_in", "not_isNull"]);
        assert_eq!(got[1].value, Some(Value::Int64(18)));
        assert_eq!(got[3].field, ["email"]);
        assert_eq!(got[3].value, None);
    }

    #[test]
    fn test_extract_rejects_unsupported() {
        let or = Expr::or(alloc::vec![Expr::eq(status(), Expr::val("a")), Expr::eq(status(), Expr::val("b"))]);
        let err = extract_simple_comparisons(Some(&or)).unwrap_err();
        assert!(err.to_string().contains("does not support 'or' operator"));

        let field_to_field = Expr::eq(status(), age());
        let err = extract_simple_comparisons(Some(&field_to_field)).unwrap_err();
        assert!(err.to_string().contains("Found complex expression for 'eq'"));

        let not_like = Expr::not(Expr::like(status(), "a%"));
        let err = extract_simple_comparisons(Some(&not_like)).unwrap_err();
        assert!(err.to_string().contains("does not support 'not(like)'"));

        let unknown = Expr::func("regexp", alloc::vec![status(), Expr::val("x")]);
        let err = extract_simple_comparisons(Some(&unknown)).unwrap_err();
        assert!(err.to_string().contains("unknown operator: 'regexp'"));
    }

    #[test]
    fn test_parse_load_subset_options() {
        let options = LoadSubsetOptions::new()
            .with_where(Expr::eq(status(), Expr::val("active")))
            .with_order_by(OrderByClause::desc(age()))
            .with_limit(20);
        let parsed = parse_load_subset_options(Some(&options)).unwrap();
        assert_eq!(parsed.filters.len(), 1);
        assert_eq!(parsed.sorts[0].field, ["age"]);
        assert_eq!(parsed.limit, Some(20));

        assert_eq!(parse_load_subset_options(None).unwrap(), ParsedLoadSubsetOptions::default());
    }
}
