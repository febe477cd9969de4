//! Per-field document deltas.
//!
//! A delta is the unit of replication: one document, a handful of field
//! paths, and the mergeable value to join in at each. A full-document
//! "replace" is expressed as one delta with every field listed; there is
//! no field-blind overwrite that bypasses per-field clocks.

use crate::document::DocumentId;
use pds_core::clock::FieldClock;
use pds_core::path::FieldPath;
use pds_core::value::CrdtValue;
use serde::{Deserialize, Serialize};

/// A set of per-field merges targeting one document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentDelta {
    pub collection: String,
    pub id: DocumentId,
    pub fields: Vec<(FieldPath, CrdtValue)>,
}

impl DocumentDelta {
    pub fn new(collection: impl Into<String>, id: DocumentId) -> Self {
        Self {
            collection: collection.into(),
            id,
            fields: Vec::new(),
        }
    }

    /// Add one field merge.
    pub fn push(&mut self, path: FieldPath, value: CrdtValue) {
        self.fields.push((path, value));
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The latest clock carried by any field in this delta.
    pub fn max_clock(&self) -> FieldClock {
        self.fields
            .iter()
            .map(|(_, value)| value.type_clock())
            .max()
            .unwrap_or_else(FieldClock::zero)
    }

    /// Rough wire size in bytes.
    pub fn estimated_size(&self) -> usize {
        self.id.estimated_size()
            + self.collection.len()
            + self
                .fields
                .iter()
                .map(|(path, value)| path.to_string().len() + value.estimated_size())
                .sum::<usize>()
    }
}

/// What applying a delta did to the local store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The document did not exist and was created.
    Created,
    /// Existing state changed.
    Updated,
    /// The delta was already covered; nothing changed (idempotent replay).
    Unchanged,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pds_core::clock::WriterId;

    #[test]
    fn test_delta_max_clock() {
        let mut delta = DocumentDelta::new("orders", DocumentId::text("o1"));
        delta.push(
            FieldPath::field("a"),
            CrdtValue::register(1i64, FieldClock::new(3, WriterId::new("x"))),
        );
        delta.push(
            FieldPath::field("b"),
            CrdtValue::register(2i64, FieldClock::new(7, WriterId::new("y"))),
        );
        assert_eq!(delta.max_clock().counter, 7);
    }
}
