//! Eviction policies.
//!
//! A policy describes which documents are candidates for local removal.
//! Two shapes are supported: flag-based (an application field marks
//! candidates, and the governing subscription is the exact complement, so
//! a re-subscribe after eviction cannot redownload what was just removed)
//! and cutoff-based (a timestamp or size field compared against a rolling
//! threshold).

use pds_core::path::FieldPath;
use pds_core::scalar::Scalar;
use pds_query::ast::{CompareOp, Expr, Literal};
use serde::{Deserialize, Serialize};

/// Storage lifecycle of one document under a policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocLifecycle {
    /// Stored and still covered by the governing subscription.
    Synced,
    /// Stored but matching the eviction predicate; the next sweep takes it.
    EvictionCandidate,
    /// Absent from local storage. No tombstone was emitted.
    Evicted,
}

/// What to evict.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EvictionPolicy {
    /// Evict documents whose boolean `flag_field` reads true.
    FlagBased {
        collection: String,
        flag_field: String,
    },
    /// Evict documents whose `timestamp_field` (epoch milliseconds) is
    /// older than `max_age_ms` at sweep time.
    AgeBased {
        collection: String,
        timestamp_field: String,
        max_age_ms: i64,
    },
    /// Evict documents whose `size_field` exceeds `max_value`.
    SizeBased {
        collection: String,
        size_field: String,
        max_value: i64,
    },
}

impl EvictionPolicy {
    pub fn collection(&self) -> &str {
        match self {
            EvictionPolicy::FlagBased { collection, .. }
            | EvictionPolicy::AgeBased { collection, .. }
            | EvictionPolicy::SizeBased { collection, .. } => collection,
        }
    }

    /// The eviction predicate P at a given sweep time.
    pub fn predicate(&self, now_ms: i64) -> Expr {
        match self {
            EvictionPolicy::FlagBased { flag_field, .. } => Expr::Compare {
                path: FieldPath::field(flag_field.clone()),
                op: CompareOp::Eq,
                value: Literal::Scalar(Scalar::Bool(true)),
            },
            EvictionPolicy::AgeBased {
                timestamp_field,
                max_age_ms,
                ..
            } => Expr::Compare {
                path: FieldPath::field(timestamp_field.clone()),
                op: CompareOp::Lt,
                value: Literal::Scalar(Scalar::Int(now_ms - max_age_ms)),
            },
            EvictionPolicy::SizeBased {
                size_field,
                max_value,
                ..
            } => Expr::Compare {
                path: FieldPath::field(size_field.clone()),
                op: CompareOp::Gt,
                value: Literal::Scalar(Scalar::Int(*max_value)),
            },
        }
    }

    /// The logical complement ¬P: the safe governing-subscription shape.
    pub fn complement(&self, now_ms: i64) -> Expr {
        self.predicate(now_ms).negated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_predicate_and_complement() {
        let policy = EvictionPolicy::FlagBased {
            collection: "cache".into(),
            flag_field: "archived".into(),
        };
        let p = policy.predicate(0);
        assert!(p.references_field("archived"));
        assert_eq!(policy.complement(0), p.negated());
    }

    #[test]
    fn test_age_predicate_uses_rolling_cutoff() {
        let policy = EvictionPolicy::AgeBased {
            collection: "cache".into(),
            timestamp_field: "fetched_at".into(),
            max_age_ms: 1_000,
        };
        let Expr::Compare { op, value, .. } = policy.predicate(10_000) else {
            panic!("expected comparison");
        };
        assert_eq!(op, CompareOp::Lt);
        assert_eq!(value, Literal::Scalar(Scalar::Int(9_000)));
    }
}
