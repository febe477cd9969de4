//! PN-counter with restart epochs.
//!
//! The counter keeps separate per-writer increment and decrement maps whose
//! merge is component-wise max, exactly like a classic PN-counter. On top
//! of that sits an epoch: `restart(value)` opens a new epoch with the given
//! base value and empty maps. Merging two counters from different epochs
//! takes the higher epoch wholesale; only within one epoch do divergent
//! increment sets sum. A restart therefore never un-merges into the
//! increments it replaced, and the whole construction stays a lattice.

use crate::clock::{FieldClock, WriterId};
use crate::merge::Merge;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A positive-negative counter with restart support.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PnCounter {
    /// Restart epoch. A higher epoch wins a merge outright.
    epoch: u64,
    /// Base value the current epoch started from.
    base: i64,
    /// Clock of the write that set `base` (creation or restart). Decides
    /// between two concurrent restarts that landed on the same epoch.
    base_clock: FieldClock,
    /// Per-writer increment totals within this epoch.
    inc: BTreeMap<WriterId, u64>,
    /// Per-writer decrement totals within this epoch.
    dec: BTreeMap<WriterId, u64>,
    /// Clock of the latest operation of any kind. Used for cross-type
    /// precedence when a counter races another variant on the same path.
    clock: FieldClock,
}

impl PnCounter {
    /// Create a fresh counter at zero.
    pub fn new(clock: FieldClock) -> Self {
        Self {
            epoch: 0,
            base: 0,
            base_clock: clock.clone(),
            inc: BTreeMap::new(),
            dec: BTreeMap::new(),
            clock,
        }
    }

    /// Current value: base + increments - decrements.
    pub fn value(&self) -> i64 {
        let inc: u64 = self.inc.values().sum();
        let dec: u64 = self.dec.values().sum();
        self.base
            .saturating_add(inc.min(i64::MAX as u64) as i64)
            .saturating_sub(dec.min(i64::MAX as u64) as i64)
    }

    /// Increment on behalf of a writer.
    pub fn increment(&mut self, writer: WriterId, amount: u64, clock: FieldClock) {
        let entry = self.inc.entry(writer).or_insert(0);
        *entry = entry.saturating_add(amount);
        self.clock = self.clock.clone().max(clock);
    }

    /// Decrement on behalf of a writer.
    pub fn decrement(&mut self, writer: WriterId, amount: u64, clock: FieldClock) {
        let entry = self.dec.entry(writer).or_insert(0);
        *entry = entry.saturating_add(amount);
        self.clock = self.clock.clone().max(clock);
    }

    /// Reset to a given value by opening a new epoch.
    ///
    /// The old epoch's increment sets are discarded, not negated: any peer
    /// that sees the restart adopts the new epoch, and increments made
    /// concurrently with the restart are dropped on every peer alike.
    pub fn restart(&mut self, value: i64, clock: FieldClock) {
        self.epoch += 1;
        self.base = value;
        self.base_clock = clock.clone();
        self.inc.clear();
        self.dec.clear();
        self.clock = self.clock.clone().max(clock);
    }

    /// Restart epoch number.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Clock of the latest operation.
    pub fn clock(&self) -> &FieldClock {
        &self.clock
    }

    /// Rough serialized size in bytes for document size accounting.
    pub fn estimated_size(&self) -> usize {
        let entry = |m: &BTreeMap<WriterId, u64>| -> usize {
            m.keys().map(|k| k.0.len() + 12).sum()
        };
        48 + entry(&self.inc) + entry(&self.dec)
    }
}

impl Merge for PnCounter {
    fn bottom() -> Self {
        Self::new(FieldClock::zero())
    }

    fn merge(&self, other: &Self) -> Self {
        // Different epochs: the higher one replaces the lower entirely.
        if self.epoch != other.epoch {
            let winner = if self.epoch > other.epoch { self } else { other };
            let mut merged = winner.clone();
            merged.clock = self.clock.clone().max(other.clock.clone());
            return merged;
        }

        // Two concurrent restarts can land on the same epoch with different
        // bases; the (base_clock, base) order picks one deterministically.
        let (base, base_clock) =
            if (&self.base_clock, self.base) >= (&other.base_clock, other.base) {
                (self.base, self.base_clock.clone())
            } else {
                (other.base, other.base_clock.clone())
            };

        let mut inc = self.inc.clone();
        for (writer, &n) in &other.inc {
            let entry = inc.entry(writer.clone()).or_insert(0);
            *entry = (*entry).max(n);
        }
        let mut dec = self.dec.clone();
        for (writer, &n) in &other.dec {
            let entry = dec.entry(writer.clone()).or_insert(0);
            *entry = (*entry).max(n);
        }

        Self {
            epoch: self.epoch,
            base,
            base_clock,
            inc,
            dec,
            clock: self.clock.clone().max(other.clock.clone()),
        }
    }
}
