//! Statement AST.
//!
//! The surface is deliberately small: single-collection SELECT with
//! aggregates, per-field UPDATE, INSERT with id-conflict policies, and
//! local-only EVICT. No joins, no subqueries.

use pds_core::path::FieldPath;
use pds_core::scalar::Scalar;
use serde::{Deserialize, Serialize};

/// A parsed statement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    Select(SelectStatement),
    Insert(InsertStatement),
    Update(UpdateStatement),
    Evict(EvictStatement),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SelectStatement {
    pub distinct: bool,
    pub projection: Projection,
    pub collection: String,
    pub predicate: Option<Expr>,
    pub group_by: Option<FieldPath>,
    pub order_by: Option<(FieldPath, SortOrder)>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Projection {
    /// `SELECT *`
    All,
    /// `SELECT a, b.c`
    Fields(Vec<FieldPath>),
    /// `SELECT COUNT(*), SUM(total)`: aggregate row(s)
    Aggregates(Vec<AggregateExpr>),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregateExpr {
    pub func: AggregateFunc,
    /// `None` for `COUNT(*)`.
    pub arg: Option<FieldPath>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunc {
    pub fn name(&self) -> &'static str {
        match self {
            AggregateFunc::Count => "COUNT",
            AggregateFunc::Sum => "SUM",
            AggregateFunc::Avg => "AVG",
            AggregateFunc::Min => "MIN",
            AggregateFunc::Max => "MAX",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// A literal operand: inline scalar or bound parameter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Scalar(Scalar),
    Positional(usize),
    Named(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Type names usable in `IS` guards.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeName {
    String,
    Number,
    Boolean,
    Null,
    Map,
    Counter,
}

/// A boolean predicate over one document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Compare {
        path: FieldPath,
        op: CompareOp,
        value: Literal,
    },
    In {
        path: FieldPath,
        values: Vec<Literal>,
    },
    /// Prefix match: the pattern may end in a single `%` wildcard.
    Like {
        path: FieldPath,
        pattern: Literal,
    },
    /// Defensive type guard, e.g. `total IS NUMBER`. Never type-mismatches.
    TypeGuard {
        path: FieldPath,
        ty: TypeName,
        negated: bool,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

impl Expr {
    /// True if any comparison in the predicate touches `field` (as the
    /// head of its path). The subscription layer uses this to reject
    /// predicates that filter on the tombstone field.
    pub fn references_field(&self, field: &str) -> bool {
        match self {
            Expr::Compare { path, .. }
            | Expr::In { path, .. }
            | Expr::Like { path, .. }
            | Expr::TypeGuard { path, .. } => path.head() == Some(field),
            Expr::And(a, b) | Expr::Or(a, b) => {
                a.references_field(field) || b.references_field(field)
            }
            Expr::Not(inner) => inner.references_field(field),
        }
    }

    /// The logical complement of this predicate.
    ///
    /// Eviction uses this to derive the governing subscription predicate
    /// from an eviction predicate (or vice versa), so evicted documents
    /// cannot be re-fetched by the complementary subscription.
    pub fn negated(&self) -> Expr {
        match self {
            Expr::Not(inner) => (**inner).clone(),
            other => Expr::Not(Box::new(other.clone())),
        }
    }
}

/// What to do when an INSERT hits an existing id.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictPolicy {
    /// Surface a conflict error (the default).
    #[default]
    Fail,
    /// Keep the existing document untouched.
    DoNothing,
    /// Merge every inserted field, changed or not. Always emits a delta.
    DoUpdate,
    /// Diff against current local state first; only changed fields merge,
    /// unchanged fields produce no delta at all.
    DoUpdateLocalDiff,
}

/// A value in an INSERT document or UPDATE assignment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ValueLiteral {
    Scalar(Literal),
    Map(Vec<(String, ValueLiteral)>),
    /// `PNCOUNTER(n)`: create a counter field starting at n.
    Counter(Literal),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InsertStatement {
    pub collection: String,
    pub documents: Vec<Vec<(String, ValueLiteral)>>,
    pub on_conflict: ConflictPolicy,
}

/// One clause of an UPDATE's SET list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SetClause {
    /// `SET path = value`
    Assign { path: FieldPath, value: ValueLiteral },
    /// `SET path = path + n` / `SET path = path - n`: counter adjustment.
    /// `negated` records the `-` form so bound parameters keep their sign.
    Adjust {
        path: FieldPath,
        amount: Literal,
        negated: bool,
    },
    /// `RESTART path TO n`: counter restart epoch.
    Restart { path: FieldPath, value: Literal },
    /// `UNSET path`: remove the field (writes a field tombstone).
    Remove { path: FieldPath },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateStatement {
    pub collection: String,
    pub sets: Vec<SetClause>,
    pub predicate: Option<Expr>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvictStatement {
    pub collection: String,
    pub predicate: Option<Expr>,
    pub limit: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_references_field() {
        let expr = Expr::And(
            Box::new(Expr::Compare {
                path: FieldPath::parse("status"),
                op: CompareOp::Eq,
                value: Literal::Scalar(Scalar::Text("open".into())),
            }),
            Box::new(Expr::Not(Box::new(Expr::Compare {
                path: FieldPath::parse("_deleted"),
                op: CompareOp::Eq,
                value: Literal::Scalar(Scalar::Bool(true)),
            }))),
        );
        assert!(expr.references_field("_deleted"));
        assert!(expr.references_field("status"));
        assert!(!expr.references_field("total"));
    }

    #[test]
    fn test_negated_unwraps_double_not() {
        let inner = Expr::Compare {
            path: FieldPath::parse("x"),
            op: CompareOp::Gt,
            value: Literal::Scalar(Scalar::Int(1)),
        };
        let negated = inner.negated();
        assert_eq!(negated.negated(), inner);
    }
}
