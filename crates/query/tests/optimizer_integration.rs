//! Integration tests for the optimizer.
//!
//! Structural checks on rewritten trees, plus end-to-end checks that an
//! optimized query produces the same results as the original one when both
//! are compiled and fed the same data.

use rill_core::{Key, Value};
use rill_incremental::Delta;
use rill_query::ast::{Expr, FromClause, JoinType, OrderByClause, QueryIr, Where};
use rill_query::{compile_query, optimize_query, PipelineRow};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

fn users() -> Vec<(Key, Value)> {
    [(1, "ann", 25), (2, "bob", 31), (3, "cid", 25), (4, "dee", 47)]
        .into_iter()
        .map(|(id, name, age)| {
            (
                Key::Int(id),
                Value::object([
                    ("id", Value::Int64(id)),
                    ("name", Value::from(name)),
                    ("age", Value::Int64(age)),
                ]),
            )
        })
        .collect()
}

fn posts() -> Vec<(Key, Value)> {
    [(10, 1, "draft"), (11, 1, "live"), (12, 2, "live"), (13, 4, "draft")]
        .into_iter()
        .map(|(id, author, status)| {
            (
                Key::Int(id),
                Value::object([
                    ("id", Value::Int64(id)),
                    ("author_id", Value::Int64(author)),
                    ("status", Value::from(status)),
                ]),
            )
        })
        .collect()
}

/// Compiles `query`, loads both collections and returns the net output.
fn execute(query: &QueryIr) -> BTreeMap<Key, Value> {
    let output: Rc<RefCell<Vec<Delta<PipelineRow>>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = output.clone();
    let mut compiled = compile_query(query, move |batch: &[Delta<PipelineRow>]| {
        sink.borrow_mut().extend(batch.iter().cloned())
    })
    .unwrap();

    for i in 0..compiled.inputs().len() {
        let rows = match compiled.inputs()[i].collection.as_str() {
            "users" => users(),
            "posts" => posts(),
            other => panic!("unexpected collection {}", other),
        };
        compiled.send(i, rows.into_iter().map(Delta::insert)).unwrap();
    }
    compiled.run().unwrap();

    let mut net: BTreeMap<Key, (Value, i32)> = BTreeMap::new();
    for d in output.borrow().iter() {
        let entry = net.entry(d.data.key.clone()).or_insert((Value::Null, 0));
        entry.1 += d.diff;
        if d.diff > 0 {
            entry.0 = d.data.output();
        }
    }
    net.into_iter()
        .filter(|(_, (_, n))| *n > 0)
        .map(|(k, (v, _))| (k, v))
        .collect()
}

fn age_is_25() -> Expr {
    Expr::eq(Expr::field("user", "age"), Expr::val(25i64))
}

fn join_posts(query: QueryIr, join_type: JoinType) -> QueryIr {
    query.with_join(
        join_type,
        FromClause::collection("posts", "post"),
        Expr::field("user", "id"),
        Expr::field("post", "author_id"),
    )
}

#[test]
fn test_pushdown_never_enters_group_by() {
    let grouped = QueryIr::from_collection("users", "inner")
        .with_select([("age", Expr::field("inner", "age"))])
        .with_group_by(Expr::field("inner", "age"));
    let query = join_posts(QueryIr::from_query(grouped.clone(), "user"), JoinType::Inner).with_where(age_is_25());

    let result = optimize_query(&query).unwrap();
    assert_eq!(result.query.from.subquery().unwrap().as_ref(), &grouped);
    assert_eq!(result.query.where_clauses, vec![Where::new(age_is_25())]);
    assert!(result.source_where_clauses.is_empty());
}

#[test]
fn test_pushdown_always_wraps_collection() {
    let query = join_posts(QueryIr::from_collection("users", "user"), JoinType::Inner).with_where(age_is_25());
    let result = optimize_query(&query).unwrap();

    let wrapped = result.query.from.subquery().unwrap();
    assert_eq!(wrapped.from, FromClause::collection("users", "user"));
    assert_eq!(wrapped.where_clauses, vec![Where::new(age_is_25())]);
    assert!(result.query.where_clauses.is_empty());
    assert_eq!(result.source_where_clauses["user"], age_is_25());

    // The input tree is untouched.
    assert!(query.from.is_collection());
    assert_eq!(query.where_clauses.len(), 1);
}

#[test]
fn test_inner_join_results_preserved() {
    let query = join_posts(QueryIr::from_collection("users", "user"), JoinType::Inner)
        .with_where(age_is_25())
        .with_where(Expr::eq(Expr::field("post", "status"), Expr::val("live")));
    let optimized = optimize_query(&query).unwrap().query;

    let expected = execute(&query);
    assert_eq!(expected.keys().collect::<Vec<_>>(), [&Key::Str("[1,11]".into())]);
    assert_eq!(execute(&optimized), expected);
}

#[test]
fn test_left_join_residual_preserves_results() {
    let query = join_posts(QueryIr::from_collection("users", "user"), JoinType::Left)
        .with_where(Expr::eq(Expr::field("post", "status"), Expr::val("draft")));
    let optimized = optimize_query(&query).unwrap().query;
    assert!(optimized.where_clauses.iter().all(|w| w.residual));
    assert!(optimized.join[0].from.subquery().is_some());

    let expected = execute(&query);
    assert_eq!(expected.len(), 2);
    assert_eq!(execute(&optimized), expected);
}

#[test]
fn test_nested_subqueries_receive_pushdown() {
    let level2 = QueryIr::from_collection("users", "u2");
    let level1 = QueryIr::from_query(level2, "u1");
    let query = join_posts(QueryIr::from_query(level1, "user"), JoinType::Inner).with_where(age_is_25());

    let result = optimize_query(&query).unwrap();
    // The passthrough levels collapse once the filter has been pushed through.
    let mut from = &result.query.from;
    let mut depth = 0;
    while let Some(sub) = from.subquery() {
        depth += 1;
        from = &sub.from;
    }
    assert!(depth >= 1);
    assert!(from.is_collection());

    assert_eq!(execute(&result.query), execute(&query));
}

#[test]
fn test_ordered_window_survives_optimization() {
    let query = join_posts(QueryIr::from_collection("users", "user"), JoinType::Inner)
        .with_where(Expr::gt(Expr::field("user", "age"), Expr::val(20i64)))
        .with_select([
            ("name", Expr::field("user", "name")),
            ("status", Expr::field("post", "status")),
        ])
        .with_order_by(OrderByClause::asc(Expr::field("post", "id")))
        .with_limit(2);
    let optimized = optimize_query(&query).unwrap().query;
    assert_eq!(optimized.limit, Some(2));

    let result = execute(&optimized);
    assert_eq!(result, execute(&query));
    assert_eq!(result.len(), 2);
}
