//! Predicate evaluation against one document.
//!
//! Evaluation is tri-state: a predicate matches, does not match, or hit a
//! type mismatch (e.g. a string register compared against a numeric
//! literal). Mismatches bubble up so the executor can skip and count the
//! document (a per-document skip, never a query-wide failure), while
//! type guards collapse the mismatch into a plain non-match, filtering
//! silently.

use crate::ast::{CompareOp, Expr, TypeName};
use crate::error::QueryError;
use crate::params::Params;
use pds_core::scalar::Scalar;
use pds_core::value::ValueView;
use pds_store::Document;
use std::cmp::Ordering;

/// Outcome of evaluating a predicate against one document.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tri {
    Match,
    NoMatch,
    /// A comparison was undefined for the value's type.
    TypeMismatch,
}

impl Tri {
    fn from_bool(matched: bool) -> Self {
        if matched {
            Tri::Match
        } else {
            Tri::NoMatch
        }
    }

    fn and(self, other: Tri) -> Tri {
        use Tri::*;
        match (self, other) {
            // A definite non-match filters regardless of the other side
            (NoMatch, _) | (_, NoMatch) => NoMatch,
            (TypeMismatch, _) | (_, TypeMismatch) => TypeMismatch,
            (Match, Match) => Match,
        }
    }

    fn or(self, other: Tri) -> Tri {
        use Tri::*;
        match (self, other) {
            (Match, _) | (_, Match) => Match,
            (TypeMismatch, _) | (_, TypeMismatch) => TypeMismatch,
            (NoMatch, NoMatch) => NoMatch,
        }
    }

    fn not(self) -> Tri {
        match self {
            Tri::Match => Tri::NoMatch,
            Tri::NoMatch => Tri::Match,
            Tri::TypeMismatch => Tri::TypeMismatch,
        }
    }
}

/// Evaluate a predicate. `None` predicates match everything.
pub fn evaluate(
    predicate: Option<&Expr>,
    doc: &Document,
    params: &Params,
) -> Result<Tri, QueryError> {
    match predicate {
        None => Ok(Tri::Match),
        Some(expr) => eval_expr(expr, doc, params),
    }
}

/// Convenience: strict boolean match (mismatches read as non-matches).
/// The replication layer uses this to gate relay decisions.
pub fn matches(predicate: Option<&Expr>, doc: &Document, params: &Params) -> bool {
    evaluate(predicate, doc, params).map(|t| t == Tri::Match).unwrap_or(false)
}

fn eval_expr(expr: &Expr, doc: &Document, params: &Params) -> Result<Tri, QueryError> {
    match expr {
        Expr::And(a, b) => Ok(eval_expr(a, doc, params)?.and(eval_expr(b, doc, params)?)),
        Expr::Or(a, b) => Ok(eval_expr(a, doc, params)?.or(eval_expr(b, doc, params)?)),
        Expr::Not(inner) => Ok(eval_expr(inner, doc, params)?.not()),

        Expr::Compare { path, op, value } => {
            let literal = params.resolve(value)?;
            let Some(actual) = doc.read_scalar(path) else {
                // Missing fields (and maps) never match a comparison
                return Ok(Tri::NoMatch);
            };
            Ok(compare(&actual, *op, &literal))
        }

        Expr::In { path, values } => {
            let Some(actual) = doc.read_scalar(path) else {
                return Ok(Tri::NoMatch);
            };
            let mut saw_mismatch = false;
            for value in values {
                let literal = params.resolve(value)?;
                match compare(&actual, CompareOp::Eq, &literal) {
                    Tri::Match => return Ok(Tri::Match),
                    Tri::NoMatch => {}
                    Tri::TypeMismatch => saw_mismatch = true,
                }
            }
            Ok(if saw_mismatch {
                Tri::TypeMismatch
            } else {
                Tri::NoMatch
            })
        }

        Expr::Like { path, pattern } => {
            let pattern = params.resolve(pattern)?;
            let Scalar::Text(pattern) = pattern else {
                return Ok(Tri::TypeMismatch);
            };
            let Some(actual) = doc.read_scalar(path) else {
                return Ok(Tri::NoMatch);
            };
            let Scalar::Text(actual) = actual else {
                return Ok(Tri::TypeMismatch);
            };
            Ok(Tri::from_bool(like_match(&actual, &pattern)))
        }

        Expr::TypeGuard { path, ty, negated } => {
            let matched = type_guard(doc, path, *ty);
            Ok(Tri::from_bool(matched != *negated))
        }
    }
}

fn compare(actual: &Scalar, op: CompareOp, literal: &Scalar) -> Tri {
    // Equality on mixed number kinds is numeric; everything else requires
    // compatible kinds.
    let ordering = match (actual, literal) {
        (a, b) if a.is_number() && b.is_number() => a.total_cmp(b),
        (Scalar::Text(a), Scalar::Text(b)) => a.cmp(b),
        (Scalar::Bool(a), Scalar::Bool(b)) => a.cmp(b),
        (Scalar::Null, Scalar::Null) => Ordering::Equal,
        (Scalar::Attachment(a), Scalar::Attachment(b)) => a.cmp(b),
        _ => return Tri::TypeMismatch,
    };

    let matched = match op {
        CompareOp::Eq => ordering == Ordering::Equal,
        CompareOp::Ne => ordering != Ordering::Equal,
        CompareOp::Lt => ordering == Ordering::Less,
        CompareOp::Le => ordering != Ordering::Greater,
        CompareOp::Gt => ordering == Ordering::Greater,
        CompareOp::Ge => ordering != Ordering::Less,
    };
    Tri::from_bool(matched)
}

/// Prefix match: a single trailing `%` matches any suffix; a pattern
/// without `%` is an exact match.
fn like_match(actual: &str, pattern: &str) -> bool {
    match pattern.strip_suffix('%') {
        Some(prefix) => actual.starts_with(prefix),
        None => actual == pattern,
    }
}

fn type_guard(doc: &Document, path: &pds_core::path::FieldPath, ty: TypeName) -> bool {
    let Some(value) = doc.get(path) else {
        return false;
    };
    match ty {
        TypeName::Map => matches!(value.view(), ValueView::Map(_)),
        TypeName::Counter => matches!(value.view(), ValueView::Counter(_)),
        TypeName::String => matches!(value.read_scalar(), Some(Scalar::Text(_))),
        TypeName::Number => value.read_scalar().is_some_and(|s| s.is_number()),
        TypeName::Boolean => matches!(value.read_scalar(), Some(Scalar::Bool(_))),
        TypeName::Null => matches!(value.read_scalar(), Some(Scalar::Null)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_statement;
    use crate::Statement;
    use pds_core::clock::{FieldClock, WriterId};
    use pds_core::value::CrdtValue;
    use pds_store::DocumentId;

    fn doc() -> Document {
        let mut doc = Document::new(
            "orders",
            DocumentId::text("o1"),
            FieldClock::new(1, WriterId::new("a")),
        );
        doc.fields.put(
            "status",
            CrdtValue::register("pending", FieldClock::new(2, WriterId::new("a"))),
        );
        doc.fields.put(
            "total",
            CrdtValue::register(40i64, FieldClock::new(3, WriterId::new("a"))),
        );
        doc
    }

    fn predicate(src: &str) -> Expr {
        let stmt = parse_statement(&format!("SELECT * FROM orders WHERE {src}")).unwrap();
        let Statement::Select(select) = stmt else {
            panic!()
        };
        select.predicate.unwrap()
    }

    fn eval(src: &str) -> Tri {
        evaluate(Some(&predicate(src)), &doc(), &Params::new()).unwrap()
    }

    #[test]
    fn test_compare_and_in() {
        assert_eq!(eval("total > 30"), Tri::Match);
        assert_eq!(eval("total >= 40.0"), Tri::Match);
        assert_eq!(eval("total < 40"), Tri::NoMatch);
        assert_eq!(eval("status IN ('open', 'pending')"), Tri::Match);
        assert_eq!(eval("status IN ('open', 'closed')"), Tri::NoMatch);
    }

    #[test]
    fn test_like_prefix() {
        assert_eq!(eval("status LIKE 'pend%'"), Tri::Match);
        assert_eq!(eval("status LIKE 'pending'"), Tri::Match);
        assert_eq!(eval("status LIKE 'x%'"), Tri::NoMatch);
    }

    #[test]
    fn test_type_mismatch_bubbles() {
        // status holds a string; numeric comparison is undefined
        assert_eq!(eval("status > 5"), Tri::TypeMismatch);
        // ...and an OR with a match still matches
        assert_eq!(eval("status > 5 OR total > 30"), Tri::Match);
        // ...while AND with a match stays a mismatch
        assert_eq!(eval("status > 5 AND total > 30"), Tri::TypeMismatch);
    }

    #[test]
    fn test_type_guard_filters_silently() {
        // The guard turns the would-be mismatch into a clean non-match
        assert_eq!(eval("status IS NUMBER AND status > 5"), Tri::NoMatch);
        assert_eq!(eval("total IS NUMBER AND total > 5"), Tri::Match);
        assert_eq!(eval("status IS NOT NUMBER"), Tri::Match);
    }

    #[test]
    fn test_missing_field_never_matches() {
        assert_eq!(eval("missing = 1"), Tri::NoMatch);
        assert_eq!(eval("missing IS NULL"), Tri::NoMatch);
    }

    #[test]
    fn test_id_fields_resolve() {
        assert_eq!(eval("_id = 'o1'"), Tri::Match);
        assert_eq!(eval("_id LIKE 'o%'"), Tri::Match);
    }
}
