//! Join-semilattice merge trait - the mathematical foundation of the store
//!
//! A join-semilattice (S, ⊔) satisfies:
//! - Commutativity: a ⊔ b = b ⊔ a
//! - Associativity: (a ⊔ b) ⊔ c = a ⊔ (b ⊔ c)
//! - Idempotence:  a ⊔ a = a
//!
//! Every field value in a Peridot document merges through this trait, which
//! is what lets peers converge regardless of delta arrival order.

use std::cmp::Ordering;

/// The core merge trait. Every replicated value type implements this.
pub trait Merge: Clone + PartialEq {
    /// The bottom element (identity for merge).
    fn bottom() -> Self;

    /// Merge two states into their least upper bound.
    /// Must be commutative, associative, and idempotent.
    fn merge(&self, other: &Self) -> Self;

    /// Partial order derived from merge: a ≤ b iff a ⊔ b = b.
    fn partial_cmp_merge(&self, other: &Self) -> Option<Ordering> {
        let merged = self.merge(other);
        if &merged == self && &merged == other {
            Some(Ordering::Equal)
        } else if &merged == other {
            Some(Ordering::Less)
        } else if &merged == self {
            Some(Ordering::Greater)
        } else {
            None // Concurrent/incomparable
        }
    }

    /// Check if self ≤ other in the merge order.
    fn precedes(&self, other: &Self) -> bool {
        matches!(
            self.partial_cmp_merge(other),
            Some(Ordering::Less) | Some(Ordering::Equal)
        )
    }

    /// Merge-assign: self = self ⊔ other.
    fn merge_assign(&mut self, other: &Self) {
        *self = self.merge(other);
    }
}
