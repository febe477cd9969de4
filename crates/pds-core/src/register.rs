//! Last-writer-wins register.
//!
//! The register always retains the scalar written under the highest
//! [`FieldClock`]. The clock's `(counter, writer)` order already breaks
//! concurrent-write ties deterministically; a final value comparison keeps
//! the merge total even for a duplicated clock.

use crate::clock::FieldClock;
use crate::merge::Merge;
use crate::scalar::Scalar;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// An LWW register holding one scalar and the clock that wrote it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Register {
    value: Scalar,
    clock: FieldClock,
}

impl Register {
    /// Create a register from a write.
    pub fn new(value: Scalar, clock: FieldClock) -> Self {
        Self { value, clock }
    }

    /// The current value.
    pub fn value(&self) -> &Scalar {
        &self.value
    }

    /// The clock of the winning write.
    pub fn clock(&self) -> &FieldClock {
        &self.clock
    }

    /// Overwrite locally; only applied if the clock is newer.
    pub fn set(&mut self, value: Scalar, clock: FieldClock) {
        if clock >= self.clock {
            self.value = value;
            self.clock = clock;
        }
    }
}

impl Merge for Register {
    fn bottom() -> Self {
        Self {
            value: Scalar::Null,
            clock: FieldClock::zero(),
        }
    }

    /// Keep the write with the higher clock; on an identical clock the
    /// scalar's total order decides, keeping merge deterministic and total.
    fn merge(&self, other: &Self) -> Self {
        let self_wins = match self.clock.cmp(&other.clock) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => self.value.total_cmp(&other.value) != Ordering::Less,
        };
        if self_wins {
            self.clone()
        } else {
            other.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::WriterId;

    fn clk(counter: u64, writer: &str) -> FieldClock {
        FieldClock::new(counter, WriterId::new(writer))
    }

    #[test]
    fn test_register_higher_clock_wins() {
        let mut reg = Register::new(Scalar::Int(10), clk(1, "a"));
        reg.set(Scalar::Int(20), clk(2, "b"));
        assert_eq!(reg.value(), &Scalar::Int(20));

        // Stale write is ignored
        reg.set(Scalar::Int(30), clk(1, "a"));
        assert_eq!(reg.value(), &Scalar::Int(20));
    }

    #[test]
    fn test_register_tie_break_writer() {
        let a = Register::new(Scalar::Text("from-a".into()), clk(5, "alice"));
        let b = Register::new(Scalar::Text("from-b".into()), clk(5, "bob"));

        let merged = a.merge(&b);
        // "bob" > "alice", so bob's write wins on both peers
        assert_eq!(merged.value(), &Scalar::Text("from-b".into()));
        assert_eq!(b.merge(&a), merged);
    }

    #[test]
    fn test_register_merge_laws() {
        let a = Register::new(Scalar::Int(1), clk(3, "a"));
        let b = Register::new(Scalar::Int(2), clk(5, "b"));
        let c = Register::new(Scalar::Int(3), clk(4, "c"));

        // Commutative
        assert_eq!(a.merge(&b), b.merge(&a));
        // Associative
        assert_eq!(a.merge(&b).merge(&c), a.merge(&b.merge(&c)));
        // Idempotent
        assert_eq!(a.merge(&a), a);
        // Bottom is identity
        assert_eq!(a.merge(&Register::bottom()), a);
    }
}
