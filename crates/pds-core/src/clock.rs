//! Logical clocks for per-field versioning.
//!
//! A [`FieldClock`] is the causal tag on a single field write: a Lamport
//! counter plus the writer that produced it. The `(counter, writer)` pair is
//! totally ordered, so two peers always agree on which of two concurrent
//! writes wins. A [`VersionVector`] summarizes everything a peer has seen by
//! tracking the highest counter per writer; it is the currency of
//! replication negotiation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Stable identity of a writing peer.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WriterId(pub String);

impl WriterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WriterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for WriterId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The logical version of a single field write.
///
/// Ordered by `(counter, writer)`: a higher counter always wins, and the
/// writer id breaks ties deterministically across peers.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldClock {
    /// Lamport counter at the time of the write.
    pub counter: u64,
    /// The writer that produced this version.
    pub writer: WriterId,
}

impl FieldClock {
    pub fn new(counter: u64, writer: WriterId) -> Self {
        Self { counter, writer }
    }

    /// The zero clock, ordered before every real write.
    pub fn zero() -> Self {
        Self {
            counter: 0,
            writer: WriterId::new(""),
        }
    }

    /// Return the later of two clocks.
    pub fn max(self, other: Self) -> Self {
        if self >= other {
            self
        } else {
            other
        }
    }
}

impl fmt::Display for FieldClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.counter, self.writer)
    }
}

/// Frontier of seen writes, one entry per writer.
///
/// Compact causal summary: for each writer only the highest counter is
/// retained, which is exact as long as a writer's counters are applied
/// contiguously (the replication layer guarantees this per peer link).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector {
    entries: BTreeMap<WriterId, u64>,
}

impl VersionVector {
    /// Create an empty version vector.
    pub fn new() -> Self {
        VersionVector {
            entries: BTreeMap::new(),
        }
    }

    /// Build from `(writer, counter)` pairs.
    pub fn from_entries(entries: impl IntoIterator<Item = (WriterId, u64)>) -> Self {
        VersionVector {
            entries: entries.into_iter().collect(),
        }
    }

    /// Highest counter seen from a writer (0 if never seen).
    pub fn get(&self, writer: &WriterId) -> u64 {
        self.entries.get(writer).copied().unwrap_or(0)
    }

    /// Record a clock, raising the writer's entry if it is newer.
    pub fn observe(&mut self, clock: &FieldClock) {
        let entry = self.entries.entry(clock.writer.clone()).or_insert(0);
        *entry = (*entry).max(clock.counter);
    }

    /// Set the counter for a writer directly.
    pub fn set(&mut self, writer: WriterId, counter: u64) {
        if counter > 0 {
            self.entries.insert(writer, counter);
        }
    }

    /// Increment a writer's counter, returning the new value.
    pub fn increment(&mut self, writer: &WriterId) -> u64 {
        let entry = self.entries.entry(writer.clone()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// True if for every writer, self[w] >= other[w].
    pub fn dominates(&self, other: &VersionVector) -> bool {
        for (writer, &counter) in &other.entries {
            if self.get(writer) < counter {
                return false;
            }
        }
        true
    }

    /// True if the vectors are concurrent (neither dominates).
    pub fn is_concurrent_with(&self, other: &VersionVector) -> bool {
        !self.dominates(other) && !other.dominates(self)
    }

    /// Check whether a specific write is covered by this vector.
    pub fn contains(&self, clock: &FieldClock) -> bool {
        self.get(&clock.writer) >= clock.counter
    }

    /// Component-wise max merge.
    pub fn merge(&mut self, other: &VersionVector) {
        for (writer, &counter) in &other.entries {
            let entry = self.entries.entry(writer.clone()).or_insert(0);
            *entry = (*entry).max(counter);
        }
    }

    /// Merged copy without modifying self.
    pub fn merged_with(&self, other: &VersionVector) -> VersionVector {
        let mut result = self.clone();
        result.merge(other);
        result
    }

    /// Writes in self that `other` has not seen, as `(writer, from, to)`
    /// contiguous ranges. This is what a peer is missing.
    pub fn diff(&self, other: &VersionVector) -> Vec<(WriterId, u64, u64)> {
        let mut missing = Vec::new();
        for (writer, &counter) in &self.entries {
            let theirs = other.get(writer);
            if counter > theirs {
                missing.push((writer.clone(), theirs + 1, counter));
            }
        }
        missing
    }

    /// Iterate over all `(writer, counter)` entries.
    pub fn iter(&self) -> impl Iterator<Item = (&WriterId, &u64)> {
        self.entries.iter()
    }

    /// Number of writers tracked.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn w(s: &str) -> WriterId {
        WriterId::new(s)
    }

    #[test]
    fn test_field_clock_ordering() {
        let a = FieldClock::new(3, w("alice"));
        let b = FieldClock::new(5, w("bob"));
        assert!(b > a);

        // Same counter: writer id breaks the tie
        let c = FieldClock::new(5, w("carol"));
        assert!(c > b);

        assert_eq!(b.clone().max(c.clone()), c);
        assert_eq!(c.clone().max(b), c);
    }

    #[test]
    fn test_version_vector_observe() {
        let mut vv = VersionVector::new();
        assert_eq!(vv.get(&w("r1")), 0);

        vv.observe(&FieldClock::new(5, w("r1")));
        assert_eq!(vv.get(&w("r1")), 5);

        // Older clock does not lower the entry
        vv.observe(&FieldClock::new(2, w("r1")));
        assert_eq!(vv.get(&w("r1")), 5);

        let seq = vv.increment(&w("r1"));
        assert_eq!(seq, 6);
    }

    #[test]
    fn test_version_vector_dominates() {
        let vv1 = VersionVector::from_entries([(w("r1"), 5), (w("r2"), 3)]);
        let vv2 = VersionVector::from_entries([(w("r1"), 3), (w("r2"), 3)]);
        let vv3 = VersionVector::from_entries([(w("r1"), 5), (w("r2"), 5)]);

        assert!(vv1.dominates(&vv2));
        assert!(!vv2.dominates(&vv1));
        assert!(vv3.dominates(&vv1));
        assert!(!vv1.dominates(&vv3));
    }

    #[test]
    fn test_version_vector_concurrent() {
        let vv1 = VersionVector::from_entries([(w("r1"), 5), (w("r2"), 3)]);
        let vv2 = VersionVector::from_entries([(w("r1"), 3), (w("r2"), 5)]);

        assert!(vv1.is_concurrent_with(&vv2));
        assert!(vv2.is_concurrent_with(&vv1));
    }

    #[test]
    fn test_version_vector_merge_and_diff() {
        let vv1 = VersionVector::from_entries([(w("r1"), 10), (w("r2"), 5)]);
        let vv2 = VersionVector::from_entries([(w("r1"), 7), (w("r2"), 5)]);

        let merged = vv1.merged_with(&vv2);
        assert_eq!(merged.get(&w("r1")), 10);
        assert_eq!(merged.get(&w("r2")), 5);

        let diff = vv1.diff(&vv2);
        assert_eq!(diff, vec![(w("r1"), 8, 10)]);
        assert!(vv2.diff(&vv1).is_empty());
    }

    #[test]
    fn test_version_vector_contains() {
        let vv = VersionVector::from_entries([(w("r1"), 5)]);

        assert!(vv.contains(&FieldClock::new(1, w("r1"))));
        assert!(vv.contains(&FieldClock::new(5, w("r1"))));
        assert!(!vv.contains(&FieldClock::new(6, w("r1"))));
        assert!(!vv.contains(&FieldClock::new(1, w("r2"))));
    }

    #[test]
    fn test_version_vector_serialization() {
        let vv = VersionVector::from_entries([(w("r1"), 5), (w("r2"), 10)]);

        let json = serde_json::to_string(&vv).unwrap();
        let deserialized: VersionVector = serde_json::from_str(&json).unwrap();
        assert_eq!(vv, deserialized);
    }
}
