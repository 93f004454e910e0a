//! Query IR: expression trees and query clauses.

mod expr;
mod query;

pub use expr::{Expr, PropRef};
pub use query::{
    CompareOptions, Direction, FromClause, JoinClause, JoinType, Nulls, OrderByClause, QueryIr,
    Select, SelectFn, StringSort, Where, WhereFn,
};
