//! Expression tree definitions.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use rill_core::Value;

/// Reference to a field through a path starting with a source alias.
///
/// `["u", "age"]` is the `age` field of the row bound to alias `u`;
/// a single-segment path refers to the whole row of that alias.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PropRef {
    pub path: Vec<String>,
}

impl PropRef {
    /// Creates a reference from path segments.
    pub fn new<I, S>(path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            path: path.into_iter().map(Into::into).collect(),
        }
    }

    /// The source alias this reference starts from.
    pub fn alias(&self) -> Option<&str> {
        self.path.first().map(String::as_str)
    }

    /// True when the reference names a whole source row rather than a field.
    pub fn is_namespace_only(&self) -> bool {
        self.path.len() == 1
    }
}

/// Expression tree node.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Expr {
    /// Field reference.
    Ref(PropRef),
    /// Literal value.
    Val(Value),
    /// Named operator applied to arguments (`eq`, `and`, `upper`, ...).
    Func { name: String, args: Vec<Expr> },
    /// Aggregate (`count`, `sum`, ...).
    Agg { name: String, args: Vec<Expr> },
}

impl Expr {
    /// Creates a field reference from path segments.
    pub fn reference<I, S>(path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Expr::Ref(PropRef::new(path))
    }

    /// Creates a reference to `alias.field`.
    pub fn field(alias: &str, field: &str) -> Self {
        Expr::reference([alias, field])
    }

    /// Creates a literal.
    pub fn val(value: impl Into<Value>) -> Self {
        Expr::Val(value.into())
    }

    pub fn func(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Func {
            name: name.into(),
            args,
        }
    }

    pub fn agg(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Agg {
            name: name.into(),
            args,
        }
    }

    pub fn eq(left: Expr, right: Expr) -> Self {
        Expr::func("eq", alloc::vec![left, right])
    }

    pub fn gt(left: Expr, right: Expr) -> Self {
        Expr::func("gt", alloc::vec![left, right])
    }

    pub fn gte(left: Expr, right: Expr) -> Self {
        Expr::func("gte", alloc::vec![left, right])
    }

    pub fn lt(left: Expr, right: Expr) -> Self {
        Expr::func("lt", alloc::vec![left, right])
    }

    pub fn lte(left: Expr, right: Expr) -> Self {
        Expr::func("lte", alloc::vec![left, right])
    }

    /// `expr IN (values...)`, with the list carried as an array literal.
    pub fn in_list(expr: Expr, values: Vec<Value>) -> Self {
        Expr::func("in", alloc::vec![expr, Expr::Val(Value::Array(values))])
    }

    pub fn and(args: Vec<Expr>) -> Self {
        Expr::func("and", args)
    }

    pub fn or(args: Vec<Expr>) -> Self {
        Expr::func("or", args)
    }

    pub fn not(expr: Expr) -> Self {
        Expr::func("not", alloc::vec![expr])
    }

    pub fn is_null(expr: Expr) -> Self {
        Expr::func("isNull", alloc::vec![expr])
    }

    pub fn is_undefined(expr: Expr) -> Self {
        Expr::func("isUndefined", alloc::vec![expr])
    }

    pub fn like(expr: Expr, pattern: &str) -> Self {
        Expr::func("like", alloc::vec![expr, Expr::val(pattern)])
    }

    pub fn ilike(expr: Expr, pattern: &str) -> Self {
        Expr::func("ilike", alloc::vec![expr, Expr::val(pattern)])
    }

    pub fn upper(expr: Expr) -> Self {
        Expr::func("upper", alloc::vec![expr])
    }

    pub fn lower(expr: Expr) -> Self {
        Expr::func("lower", alloc::vec![expr])
    }

    pub fn length(expr: Expr) -> Self {
        Expr::func("length", alloc::vec![expr])
    }

    pub fn concat(args: Vec<Expr>) -> Self {
        Expr::func("concat", args)
    }

    pub fn add(left: Expr, right: Expr) -> Self {
        Expr::func("add", alloc::vec![left, right])
    }

    pub fn coalesce(args: Vec<Expr>) -> Self {
        Expr::func("coalesce", args)
    }

    pub fn count(expr: Expr) -> Self {
        Expr::agg("count", alloc::vec![expr])
    }

    pub fn sum(expr: Expr) -> Self {
        Expr::agg("sum", alloc::vec![expr])
    }

    pub fn avg(expr: Expr) -> Self {
        Expr::agg("avg", alloc::vec![expr])
    }

    pub fn min(expr: Expr) -> Self {
        Expr::agg("min", alloc::vec![expr])
    }

    pub fn max(expr: Expr) -> Self {
        Expr::agg("max", alloc::vec![expr])
    }

    /// Returns the reference if this is a `Ref` node.
    pub fn as_ref_path(&self) -> Option<&PropRef> {
        match self {
            Expr::Ref(r) => Some(r),
            _ => None,
        }
    }

    /// Returns the literal if this is a `Val` node.
    pub fn as_val(&self) -> Option<&Value> {
        match self {
            Expr::Val(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the arguments when this is a `Func` with the given name.
    pub fn func_args(&self, name: &str) -> Option<&[Expr]> {
        match self {
            Expr::Func { name: n, args } if n == name => Some(args),
            _ => None,
        }
    }

    /// Operator name of `Func` and `Agg` nodes.
    pub fn name(&self) -> Option<&str> {
        match self {
            Expr::Func { name, .. } | Expr::Agg { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Child expressions.
    pub fn args(&self) -> &[Expr] {
        match self {
            Expr::Func { args, .. } | Expr::Agg { args, .. } => args,
            _ => &[],
        }
    }

    /// Short tag for diagnostics: `ref`, `val`, `func` or `agg`.
    pub fn kind(&self) -> &'static str {
        match self {
            Expr::Ref(_) => "ref",
            Expr::Val(_) => "val",
            Expr::Func { .. } => "func",
            Expr::Agg { .. } => "agg",
        }
    }

    /// True if an aggregate appears anywhere in this tree.
    pub fn contains_aggregate(&self) -> bool {
        match self {
            Expr::Agg { .. } => true,
            Expr::Func { args, .. } => args.iter().any(Expr::contains_aggregate),
            _ => false,
        }
    }

    /// Collects every field reference in this tree, in visit order.
    pub fn collect_refs<'a>(&'a self, out: &mut Vec<&'a PropRef>) {
        match self {
            Expr::Ref(r) => out.push(r),
            Expr::Val(_) => {}
            Expr::Func { args, .. } | Expr::Agg { args, .. } => {
                for arg in args {
                    arg.collect_refs(out);
                }
            }
        }
    }

    /// Rewrites references starting with `from` so they start with `to`.
    pub fn rename_alias(&self, from: &str, to: &str) -> Expr {
        match self {
            Expr::Ref(r) if r.alias() == Some(from) => {
                let mut path = r.path.clone();
                path[0] = to.into();
                Expr::Ref(PropRef { path })
            }
            Expr::Ref(_) | Expr::Val(_) => self.clone(),
            Expr::Func { name, args } => Expr::Func {
                name: name.clone(),
                args: args.iter().map(|a| a.rename_alias(from, to)).collect(),
            },
            Expr::Agg { name, args } => Expr::Agg {
                name: name.clone(),
                args: args.iter().map(|a| a.rename_alias(from, to)).collect(),
            },
        }
    }

    /// Drops the leading alias segment of references starting with `alias`,
    /// making the expression evaluable against a bare source row.
    pub fn strip_alias(&self, alias: &str) -> Expr {
        match self {
            Expr::Ref(r) if r.alias() == Some(alias) => Expr::Ref(PropRef {
                path: r.path[1..].to_vec(),
            }),
            Expr::Ref(_) | Expr::Val(_) => self.clone(),
            Expr::Func { name, args } => Expr::Func {
                name: name.clone(),
                args: args.iter().map(|a| a.strip_alias(alias)).collect(),
            },
            Expr::Agg { name, args } => Expr::Agg {
                name: name.clone(),
                args: args.iter().map(|a| a.strip_alias(alias)).collect(),
            },
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Ref(r) => write!(f, "{}", r.path.join(".")),
            Expr::Val(Value::String(s)) => write!(f, "'{}'", s),
            Expr::Val(v) => write!(f, "{}", v),
            Expr::Func { name, args } | Expr::Agg { name, args } => {
                write!(f, "{}(", name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_builders() {
        let e = Expr::eq(Expr::field("u", "age"), Expr::val(25i64));
        assert_eq!(e.name(), Some("eq"));
        assert_eq!(e.args().len(), 2);
        assert_eq!(e.args()[0].as_ref_path().unwrap().alias(), Some("u"));
        assert_eq!(e.args()[1].as_val(), Some(&Value::Int64(25)));
    }

    #[test]
    fn test_namespace_only() {
        assert!(PropRef::new(["u"]).is_namespace_only());
        assert!(!PropRef::new(["u", "id"]).is_namespace_only());
    }

    #[test]
    fn test_contains_aggregate() {
        assert!(Expr::gt(Expr::count(Expr::field("o", "id")), Expr::val(1i64)).contains_aggregate());
        assert!(!Expr::gt(Expr::field("o", "id"), Expr::val(1i64)).contains_aggregate());
    }

    #[test]
    fn test_rename_and_strip_alias() {
        let e = Expr::and(alloc::vec![
            Expr::eq(Expr::field("u", "age"), Expr::val(1i64)),
            Expr::eq(Expr::field("p", "id"), Expr::field("u", "id")),
        ]);
        assert_eq!(e.rename_alias("u", "x").to_string(), "and(eq(x.age, 1), eq(p.id, x.id))");
        assert_eq!(e.strip_alias("u").to_string(), "and(eq(age, 1), eq(p.id, id))");
    }

    #[test]
    fn test_collect_refs() {
        let e = Expr::or(alloc::vec![
            Expr::is_null(Expr::reference(["o"])),
            Expr::like(Expr::field("u", "name"), "a%"),
        ]);
        let mut refs = Vec::new();
        e.collect_refs(&mut refs);
        assert_eq!(refs.len(), 2);
        assert!(refs[0].is_namespace_only());
    }
}
