//! Query IR: sources, clauses and the query tree itself.

use super::expr::Expr;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use rill_core::Value;

pub use rill_incremental::JoinType;

/// Imperative projection applied to the namespaced row.
#[derive(Clone)]
pub struct SelectFn(pub Rc<dyn Fn(&Value) -> Value>);

/// Imperative filter applied to the namespaced row.
#[derive(Clone)]
pub struct WhereFn(pub Rc<dyn Fn(&Value) -> bool>);

impl SelectFn {
    pub fn new<F: Fn(&Value) -> Value + 'static>(f: F) -> Self {
        SelectFn(Rc::new(f))
    }
}

impl WhereFn {
    pub fn new<F: Fn(&Value) -> bool + 'static>(f: F) -> Self {
        WhereFn(Rc::new(f))
    }
}

// Closures compare by identity.
impl PartialEq for SelectFn {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for WhereFn {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for SelectFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SelectFn(..)")
    }
}

impl fmt::Debug for WhereFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WhereFn(..)")
    }
}

/// A query source bound to an alias.
#[derive(Clone, Debug, PartialEq)]
pub enum FromClause {
    /// A base collection, identified by its id.
    Collection { collection: String, alias: String },
    /// A nested query. Shared so unchanged subtrees are reused across rewrites.
    Query { query: Rc<QueryIr>, alias: String },
}

impl FromClause {
    pub fn collection(collection: impl Into<String>, alias: impl Into<String>) -> Self {
        FromClause::Collection {
            collection: collection.into(),
            alias: alias.into(),
        }
    }

    pub fn query(query: QueryIr, alias: impl Into<String>) -> Self {
        FromClause::Query {
            query: Rc::new(query),
            alias: alias.into(),
        }
    }

    pub fn alias(&self) -> &str {
        match self {
            FromClause::Collection { alias, .. } | FromClause::Query { alias, .. } => alias,
        }
    }

    pub fn is_collection(&self) -> bool {
        matches!(self, FromClause::Collection { .. })
    }

    /// The nested query, when this source is one.
    pub fn subquery(&self) -> Option<&Rc<QueryIr>> {
        match self {
            FromClause::Query { query, .. } => Some(query),
            FromClause::Collection { .. } => None,
        }
    }
}

/// A WHERE clause.
///
/// Residual clauses are copies of clauses already pushed into a source,
/// kept on the outer query so they still apply after outer-join padding.
#[derive(Clone, Debug, PartialEq)]
pub struct Where {
    pub expression: Expr,
    pub residual: bool,
}

impl Where {
    pub fn new(expression: Expr) -> Self {
        Self {
            expression,
            residual: false,
        }
    }

    pub fn residual(expression: Expr) -> Self {
        Self {
            expression,
            residual: true,
        }
    }
}

impl From<Expr> for Where {
    fn from(expression: Expr) -> Self {
        Where::new(expression)
    }
}

/// A join against another source.
///
/// `left` and `right` are the two sides of the equality condition; either may
/// reference the joined source.
#[derive(Clone, Debug, PartialEq)]
pub struct JoinClause {
    pub from: FromClause,
    pub join_type: JoinType,
    pub left: Expr,
    pub right: Expr,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Nulls {
    #[default]
    First,
    Last,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum StringSort {
    /// Code point order.
    #[default]
    Lexical,
    /// Case-insensitive collation, ties broken by code point order.
    Locale,
}

/// How two ORDER BY keys compare.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct CompareOptions {
    pub direction: Direction,
    pub nulls: Nulls,
    pub string_sort: StringSort,
    pub locale: Option<String>,
}

impl CompareOptions {
    pub fn asc() -> Self {
        Self::default()
    }

    pub fn desc() -> Self {
        Self {
            direction: Direction::Desc,
            ..Self::default()
        }
    }

    pub fn with_nulls(mut self, nulls: Nulls) -> Self {
        self.nulls = nulls;
        self
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.string_sort = StringSort::Locale;
        self.locale = Some(locale.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OrderByClause {
    pub expression: Expr,
    pub compare: CompareOptions,
}

impl OrderByClause {
    pub fn new(expression: Expr, compare: CompareOptions) -> Self {
        Self {
            expression,
            compare,
        }
    }

    pub fn asc(expression: Expr) -> Self {
        Self::new(expression, CompareOptions::asc())
    }

    pub fn desc(expression: Expr) -> Self {
        Self::new(expression, CompareOptions::desc())
    }
}

/// Projection: output field name to expression, in output order.
pub type Select = Vec<(String, Expr)>;

/// A query tree.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryIr {
    pub from: FromClause,
    pub select: Option<Select>,
    pub join: Vec<JoinClause>,
    pub where_clauses: Vec<Where>,
    pub group_by: Vec<Expr>,
    pub having: Vec<Expr>,
    pub order_by: Vec<OrderByClause>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub distinct: bool,
    pub fn_select: Option<SelectFn>,
    pub fn_where: Vec<WhereFn>,
    pub fn_having: Vec<WhereFn>,
}

impl QueryIr {
    /// A query with only a source.
    pub fn new(from: FromClause) -> Self {
        Self {
            from,
            select: None,
            join: Vec::new(),
            where_clauses: Vec::new(),
            group_by: Vec::new(),
            having: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
            distinct: false,
            fn_select: None,
            fn_where: Vec::new(),
            fn_having: Vec::new(),
        }
    }

    pub fn from_collection(collection: impl Into<String>, alias: impl Into<String>) -> Self {
        Self::new(FromClause::collection(collection, alias))
    }

    pub fn from_query(query: QueryIr, alias: impl Into<String>) -> Self {
        Self::new(FromClause::query(query, alias))
    }

    pub fn with_where(mut self, expression: Expr) -> Self {
        self.where_clauses.push(Where::new(expression));
        self
    }

    pub fn with_join(mut self, join_type: JoinType, from: FromClause, left: Expr, right: Expr) -> Self {
        self.join.push(JoinClause {
            from,
            join_type,
            left,
            right,
        });
        self
    }

    pub fn with_select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = (S, Expr)>,
        S: Into<String>,
    {
        self.select = Some(fields.into_iter().map(|(k, e)| (k.into(), e)).collect());
        self
    }

    pub fn with_group_by(mut self, expression: Expr) -> Self {
        self.group_by.push(expression);
        self
    }

    pub fn with_having(mut self, expression: Expr) -> Self {
        self.having.push(expression);
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

    pub fn with_distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn with_fn_select(mut self, f: SelectFn) -> Self {
        self.fn_select = Some(f);
        self
    }

    pub fn with_fn_where(mut self, f: WhereFn) -> Self {
        self.fn_where.push(f);
        self
    }

    pub fn with_fn_having(mut self, f: WhereFn) -> Self {
        self.fn_having.push(f);
        self
    }

    /// True when rows are folded into groups: GROUP BY is present or the
    /// projection contains an aggregate.
    pub fn is_grouped(&self) -> bool {
        !self.group_by.is_empty()
            || self
                .select
                .as_ref()
                .is_some_and(|select| select.iter().any(|(_, e)| e.contains_aggregate()))
    }

    /// The source bound to `alias` at this level (FROM or a join).
    pub fn source(&self, alias: &str) -> Option<&FromClause> {
        if self.from.alias() == alias {
            return Some(&self.from);
        }
        self.join.iter().map(|j| &j.from).find(|f| f.alias() == alias)
    }

    /// True when any join pads missing rows with nulls.
    pub fn has_outer_joins(&self) -> bool {
        self.join
            .iter()
            .any(|j| !matches!(j.join_type, JoinType::Inner))
    }
}
