//! Map CRDT - the recursive field container.
//!
//! A map holds named child values, each itself a [`CrdtValue`]. Merge
//! recurses field by field, so two peers editing disjoint keys never
//! conflict. Key presence is a per-key operation: removing a key writes a
//! tombstone under it rather than forgetting the entry, which is what lets
//! the removal replicate and win (or lose) against concurrent writes by
//! clock.

use crate::clock::FieldClock;
use crate::merge::Merge;
use crate::path::FieldPath;
use crate::value::CrdtValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A nested field collection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CrdtMap {
    entries: BTreeMap<String, CrdtValue>,
    /// Clock at which a map was (re-)established on this path.
    established: FieldClock,
}

impl CrdtMap {
    /// Create an empty map established at the given clock.
    pub fn new(established: FieldClock) -> Self {
        Self {
            entries: BTreeMap::new(),
            established,
        }
    }

    /// Clock at which this map's type was established on its path.
    pub fn established(&self) -> &FieldClock {
        &self.established
    }

    /// Write a child value, merging with whatever is already there.
    pub fn put(&mut self, key: impl Into<String>, value: CrdtValue) {
        let key = key.into();
        match self.entries.get(&key) {
            Some(existing) => {
                let merged = existing.merge(&value);
                self.entries.insert(key, merged);
            }
            None => {
                self.entries.insert(key, value);
            }
        }
    }

    /// Remove a key by writing a tombstone under it.
    pub fn remove(&mut self, key: &str, clock: FieldClock) {
        self.put(key, CrdtValue::tombstone(clock));
    }

    /// Get a live child value (tombstoned keys read as absent).
    pub fn get(&self, key: &str) -> Option<&CrdtValue> {
        self.entries.get(key).filter(|v| !v.is_tombstone())
    }

    /// Get a child entry including tombstones.
    pub fn get_raw(&self, key: &str) -> Option<&CrdtValue> {
        self.entries.get(key)
    }

    /// Resolve a nested path to a live value.
    pub fn get_path(&self, path: &FieldPath) -> Option<&CrdtValue> {
        let mut segments = path.segments().iter();
        let first = segments.next()?;
        let mut current = self.get(first)?;
        for segment in segments {
            current = current.as_map()?.get(segment)?;
        }
        Some(current)
    }

    /// Merge a value in at a nested path, creating intermediate maps as
    /// needed. The spine maps are established at the value's own clock, so
    /// a concurrent cross-type race on a spine segment still resolves by
    /// clock precedence.
    pub fn merge_at(&mut self, path: &FieldPath, value: CrdtValue) {
        let segments = path.segments();
        match segments.len() {
            0 => {}
            1 => self.put(segments[0].clone(), value),
            _ => {
                let clock = value.type_clock();
                let mut nested = value;
                for segment in segments[1..].iter().rev() {
                    let mut spine = CrdtMap::new(clock.clone());
                    spine.entries.insert(segment.clone(), nested);
                    nested = CrdtValue::map(spine);
                }
                self.put(segments[0].clone(), nested);
            }
        }
    }

    /// True if the key exists and is not tombstoned.
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Live keys.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries
            .iter()
            .filter(|(_, v)| !v.is_tombstone())
            .map(|(k, _)| k)
    }

    /// Live entries.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &CrdtValue)> {
        self.entries.iter().filter(|(_, v)| !v.is_tombstone())
    }

    /// All entries, tombstones included (replication needs these).
    pub fn iter_raw(&self) -> impl Iterator<Item = (&String, &CrdtValue)> {
        self.entries.iter()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.keys().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rough serialized size in bytes for document size accounting.
    pub fn estimated_size(&self) -> usize {
        24 + self
            .entries
            .iter()
            .map(|(k, v)| k.len() + 2 + v.estimated_size())
            .sum::<usize>()
    }
}

impl Merge for CrdtMap {
    fn bottom() -> Self {
        Self::new(FieldClock::zero())
    }

    /// Merge field by field; the established clock takes the max.
    fn merge(&self, other: &Self) -> Self {
        let mut entries = self.entries.clone();
        for (key, value) in &other.entries {
            match entries.get(key) {
                Some(existing) => {
                    let merged = existing.merge(value);
                    entries.insert(key.clone(), merged);
                }
                None => {
                    entries.insert(key.clone(), value.clone());
                }
            }
        }
        Self {
            entries,
            established: self.established.clone().max(other.established.clone()),
        }
    }
}
