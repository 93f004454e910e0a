//! Compilation of query trees into dataflow graphs.
//!
//! Every row flowing through the graph is a `PipelineRow`: the item key plus a
//! namespaced object mapping each source alias to that source's row. Sources
//! feed graph inputs, joins merge namespaces, WHERE clauses become filters,
//! the projection fills `result`, and ORDER BY/LIMIT/OFFSET go through a
//! single-group top-K stage that assigns fractional indices. Grouped queries
//! replace the projection with an aggregation stage followed by HAVING, and
//! DISTINCT keeps one row per projected value.

use crate::ast::{Expr, FromClause, JoinClause, OrderByClause, QueryIr};
use crate::eval::{compile_expression, compile_order_by, compile_predicate, order_by_comparator, CompiledExpr};
use crate::grouping::{grouped_aggregate, grouped_order_by, rewrite_for_groups};
use alloc::collections::BTreeMap;
use alloc::format;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use core::cmp::Ordering;
use rill_core::{Error, Key, Result, Value};
use rill_incremental::{
    DataflowGraph, Delta, Distinct, GroupedTopK, GroupedTopKOptions, JoinOperator, NodeId, TopKHandle,
    TopKOperator,
};

/// A row inside a compiled pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PipelineRow {
    pub key: Key,
    /// Object mapping source aliases to rows. Absent aliases are the
    /// null-padded side of an outer join.
    pub namespaced: Value,
    /// Projected output, set once the projection stage has run.
    pub result: Option<Value>,
    /// Fractional index assigned by the ordering stage.
    pub order_index: Option<String>,
}

impl PipelineRow {
    /// Wraps a source row under its alias.
    pub fn source(key: Key, alias: &str, row: Value) -> Self {
        let mut namespaced = BTreeMap::new();
        namespaced.insert(String::from(alias), row);
        Self {
            key,
            namespaced: Value::Object(namespaced),
            result: None,
            order_index: None,
        }
    }

    /// The projected output, or null before projection.
    pub fn output(&self) -> Value {
        self.result.clone().unwrap_or(Value::Null)
    }
}

/// A graph input bound to a collection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompiledInput {
    pub alias: String,
    pub collection: String,
    node: NodeId,
}

/// Handle to the ordering stage of the outermost query.
pub type OrderHandle = TopKHandle<Key, PipelineRow>;

/// A finalized pipeline for one query.
pub struct CompiledQuery {
    graph: DataflowGraph<PipelineRow>,
    inputs: Vec<CompiledInput>,
    order: Option<OrderHandle>,
}

impl CompiledQuery {
    /// Graph inputs, one per collection occurrence in the query tree.
    pub fn inputs(&self) -> &[CompiledInput] {
        &self.inputs
    }

    /// Queues source changes on input `input`. Processed by the next `run`.
    pub fn send<I>(&mut self, input: usize, changes: I) -> Result<()>
    where
        I: IntoIterator<Item = Delta<(Key, Value)>>,
    {
        let target = self
            .inputs
            .get(input)
            .ok_or_else(|| Error::graph_state(format!("unknown input {}", input)))?;
        let alias = target.alias.as_str();
        let batch = changes
            .into_iter()
            .map(|d| d.map(|(key, row)| PipelineRow::source(key, alias, row)))
            .collect();
        self.graph.send(target.node, batch)
    }

    pub fn run(&mut self) -> Result<()> {
        self.graph.run()
    }

    pub fn has_pending(&self) -> bool {
        self.graph.has_pending()
    }

    /// The ordering stage, when the query has ORDER BY, LIMIT or OFFSET.
    pub fn order(&self) -> Option<&OrderHandle> {
        self.order.as_ref()
    }
}

/// Compiles a query and routes its output deltas to `sink`.
pub fn compile_query<F>(query: &QueryIr, sink: F) -> Result<CompiledQuery>
where
    F: FnMut(&[Delta<PipelineRow>]) + 'static,
{
    let mut builder = Builder {
        graph: DataflowGraph::new(),
        inputs: Vec::new(),
    };
    let (node, order) = builder.compile(query)?;
    builder.graph.output(node, sink)?;
    builder.graph.finalize();
    Ok(CompiledQuery {
        graph: builder.graph,
        inputs: builder.inputs,
        order,
    })
}

struct Builder {
    graph: DataflowGraph<PipelineRow>,
    inputs: Vec<CompiledInput>,
}

impl Builder {
    fn compile(&mut self, query: &QueryIr) -> Result<(NodeId, Option<OrderHandle>)> {
        validate(query)?;

        let mut node = self.compile_source(&query.from)?;
        for join in &query.join {
            node = self.compile_join(node, join)?;
        }
        for clause in &query.where_clauses {
            let predicate = compile_predicate(&clause.expression)?;
            node = self
                .graph
                .filter(node, move |row: &PipelineRow| predicate(&row.namespaced))?;
        }
        for f in &query.fn_where {
            let f = f.0.clone();
            node = self.graph.filter(node, move |row: &PipelineRow| f(&row.namespaced))?;
        }

        let order_by = if query.is_grouped() {
            node = self.compile_grouping(node, query)?;
            grouped_order_by(query)?
        } else {
            // Without grouping, functional HAVING filters rows like WHERE.
            for f in &query.fn_having {
                let f = f.0.clone();
                node = self.graph.filter(node, move |row: &PipelineRow| f(&row.namespaced))?;
            }
            let project = projection(query)?;
            node = self.graph.map(node, move |mut row: PipelineRow| {
                row.result = Some(project(&row.namespaced));
                row
            })?;
            query.order_by.clone()
        };

        if query.distinct {
            let distinct = Distinct::new(|row: &PipelineRow| row.output());
            node = self.graph.add_operator(distinct, &[node])?;
        }

        if order_by.is_empty() && query.limit.is_none() && query.offset.is_none() {
            return Ok((node, None));
        }
        let (node, handle) = self.compile_order(node, &order_by, query)?;
        Ok((node, Some(handle)))
    }

    /// Aggregation followed by HAVING filters over the grouped rows.
    fn compile_grouping(&mut self, input: NodeId, query: &QueryIr) -> Result<NodeId> {
        let mut node = self.graph.add_operator(grouped_aggregate(query)?, &[input])?;
        for clause in &query.having {
            let predicate = compile_predicate(&rewrite_for_groups(clause, query)?)?;
            node = self
                .graph
                .filter(node, move |row: &PipelineRow| predicate(&row.namespaced))?;
        }
        for f in &query.fn_having {
            let f = f.0.clone();
            node = self.graph.filter(node, move |row: &PipelineRow| f(&row.namespaced))?;
        }
        Ok(node)
    }

    fn compile_source(&mut self, from: &FromClause) -> Result<NodeId> {
        match from {
            FromClause::Collection { collection, alias } => {
                let node = self.graph.add_input()?;
                self.inputs.push(CompiledInput {
                    alias: alias.clone(),
                    collection: collection.clone(),
                    node,
                });
                Ok(node)
            }
            FromClause::Query { query, alias } => {
                let (inner, _) = self.compile(query)?;
                let alias = alias.clone();
                self.graph.map(inner, move |row: PipelineRow| {
                    let output = row.output();
                    PipelineRow::source(row.key, &alias, output)
                })
            }
        }
    }

    fn compile_join(&mut self, left: NodeId, join: &JoinClause) -> Result<NodeId> {
        let right = self.compile_source(&join.from)?;
        let joined = join.from.alias();

        // Either side of the condition may name the joined source.
        let (left_expr, right_expr) =
            if references_alias(&join.left, joined) && !references_alias(&join.right, joined) {
                (&join.right, &join.left)
            } else {
                (&join.left, &join.right)
            };
        let left_key = compile_expression(left_expr)?;
        let right_key = compile_expression(right_expr)?;

        let operator = JoinOperator::new(
            join.join_type,
            move |row: &PipelineRow| left_key(&row.namespaced),
            move |row: &PipelineRow| right_key(&row.namespaced),
            combine_joined,
        );
        self.graph.add_operator(operator, &[left, right])
    }

    fn compile_order(
        &mut self,
        input: NodeId,
        order_by: &[OrderByClause],
        query: &QueryIr,
    ) -> Result<(NodeId, OrderHandle)> {
        let comparator: Rc<dyn Fn(&PipelineRow, &PipelineRow) -> Ordering> = if order_by.is_empty() {
            Rc::new(|_: &PipelineRow, _: &PipelineRow| Ordering::Equal)
        } else {
            let sort_key: CompiledExpr = compile_order_by(order_by)?;
            let compare = order_by_comparator(order_by);
            Rc::new(move |a: &PipelineRow, b: &PipelineRow| {
                compare(&sort_key(&a.namespaced), &sort_key(&b.namespaced))
            })
        };

        let mut options = GroupedTopKOptions::default().with_offset(query.offset.unwrap_or(0));
        if let Some(limit) = query.limit {
            options = options.with_limit(limit);
        }
        let topk = GroupedTopK::new(move |a: &PipelineRow, b: &PipelineRow| comparator(a, b), options);
        let (operator, handle) = TopKOperator::new(
            topk,
            |row: &PipelineRow| row.key.clone(),
            |mut row: PipelineRow, index: &str| {
                row.order_index = Some(String::from(index));
                row
            },
        );
        let node = self.graph.add_operator(operator, &[input])?;
        Ok((node, handle))
    }
}

fn validate(query: &QueryIr) -> Result<()> {
    if query.distinct && query.select.is_none() && query.fn_select.is_none() {
        return Err(Error::invalid_operation("DISTINCT requires a SELECT clause"));
    }
    if !query.having.is_empty() && !query.is_grouped() {
        return Err(Error::invalid_operation(
            "HAVING requires GROUP BY or an aggregate in SELECT",
        ));
    }
    Ok(())
}

/// Builds the function producing a row's output value.
///
/// Without a projection a single-source query emits the source row itself
/// and a joined query emits the namespaced object.
fn projection(query: &QueryIr) -> Result<CompiledExpr> {
    if let Some(f) = &query.fn_select {
        return Ok(f.0.clone());
    }
    if let Some(select) = &query.select {
        let fields = select
            .iter()
            .map(|(name, expr)| Ok((name.clone(), compile_expression(expr)?)))
            .collect::<Result<Vec<(String, CompiledExpr)>>>()?;
        return Ok(Rc::new(move |row: &Value| {
            Value::Object(fields.iter().map(|(name, f)| (name.clone(), f(row))).collect())
        }));
    }
    if query.join.is_empty() {
        let alias = String::from(query.from.alias());
        return Ok(Rc::new(move |row: &Value| {
            row.get_field(&alias).cloned().unwrap_or(Value::Null)
        }));
    }
    Ok(Rc::new(|row: &Value| row.clone()))
}

fn references_alias(expr: &Expr, alias: &str) -> bool {
    let mut refs = Vec::new();
    expr.collect_refs(&mut refs);
    refs.iter().any(|r| r.alias() == Some(alias))
}

fn combine_joined(left: Option<PipelineRow>, right: Option<PipelineRow>) -> PipelineRow {
    let side = |row: &Option<PipelineRow>| match row {
        Some(row) => format!("{}", row.key),
        None => String::from("null"),
    };
    let key = Key::Str(format!("[{},{}]", side(&left), side(&right)));
    let namespaced = match (left, right) {
        (Some(l), Some(r)) => l.namespaced.merged_with(&r.namespaced),
        (Some(one), None) | (None, Some(one)) => one.namespaced,
        (None, None) => Value::Object(BTreeMap::new()),
    };
    PipelineRow {
        key,
        namespaced,
        result: None,
        order_index: None,
    }
}
