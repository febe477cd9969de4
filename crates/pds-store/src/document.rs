//! Documents and their identifiers.
//!
//! A document is a keyed CRDT field tree plus system metadata: the
//! per-document version vector (summarizing every field clock it has
//! absorbed) and an incrementally maintained size estimate. The id is
//! immutable once created; logical deletion is the regular mergeable
//! `_deleted` register field, which replicates like any other field.

use pds_core::clock::{FieldClock, VersionVector};
use pds_core::map::CrdtMap;
use pds_core::path::FieldPath;
use pds_core::scalar::Scalar;
use pds_core::value::{CrdtValue, ValueView};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved field name for the application tombstone register.
pub const TOMBSTONE_FIELD: &str = "_deleted";

/// A scalar usable as a composite key component.
///
/// Floats and attachments are excluded: key components must be hashable
/// and totally ordered without caveats, and a float key would make two
/// peers disagree on identity after any arithmetic.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyScalar {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
}

impl KeyScalar {
    /// Convert from a general scalar, if it is key-safe.
    pub fn from_scalar(scalar: &Scalar) -> Option<Self> {
        match scalar {
            Scalar::Null => Some(KeyScalar::Null),
            Scalar::Bool(b) => Some(KeyScalar::Bool(*b)),
            Scalar::Int(i) => Some(KeyScalar::Int(*i)),
            Scalar::Text(s) => Some(KeyScalar::Text(s.clone())),
            Scalar::Float(_) | Scalar::Attachment(_) => None,
        }
    }

    pub fn to_scalar(&self) -> Scalar {
        match self {
            KeyScalar::Null => Scalar::Null,
            KeyScalar::Bool(b) => Scalar::Bool(*b),
            KeyScalar::Int(i) => Scalar::Int(*i),
            KeyScalar::Text(s) => Scalar::Text(s.clone()),
        }
    }
}

impl fmt::Display for KeyScalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyScalar::Null => write!(f, "null"),
            KeyScalar::Bool(b) => write!(f, "{}", b),
            KeyScalar::Int(i) => write!(f, "{}", i),
            KeyScalar::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Unique identifier for a document: a plain string or an ordered list of
/// named scalar components. Immutable once the document exists; the
/// component order is part of the identity.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DocumentId {
    Text(String),
    Composite(Vec<(String, KeyScalar)>),
}

impl DocumentId {
    /// Generate a fresh unique string id.
    pub fn generate() -> Self {
        DocumentId::Text(ulid::Ulid::new().to_string())
    }

    pub fn text(id: impl Into<String>) -> Self {
        DocumentId::Text(id.into())
    }

    pub fn composite(components: Vec<(String, KeyScalar)>) -> Self {
        DocumentId::Composite(components)
    }

    /// Read one component of a composite id (or the whole string id when
    /// `field` is `_id`).
    pub fn component(&self, field: &str) -> Option<Scalar> {
        match self {
            DocumentId::Text(s) if field == "_id" => Some(Scalar::Text(s.clone())),
            DocumentId::Text(_) => None,
            DocumentId::Composite(parts) => parts
                .iter()
                .find(|(name, _)| name == field)
                .map(|(_, v)| v.to_scalar()),
        }
    }

    /// True if `field` names this id or one of its composite components.
    /// `DISTINCT` on such a field is a no-op: the value is already unique.
    pub fn covers_field(&self, field: &str) -> bool {
        match self {
            DocumentId::Text(_) => field == "_id",
            DocumentId::Composite(parts) => {
                field == "_id" || parts.iter().any(|(name, _)| name == field)
            }
        }
    }

    /// Rough serialized size in bytes.
    pub fn estimated_size(&self) -> usize {
        match self {
            DocumentId::Text(s) => s.len() + 2,
            DocumentId::Composite(parts) => parts
                .iter()
                .map(|(name, value)| name.len() + value.to_scalar().estimated_size() + 4)
                .sum(),
        }
    }
}

// Composite ids render as `k1=v1,k2=v2`.
impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentId::Text(s) => write!(f, "{}", s),
            DocumentId::Composite(parts) => {
                let mut first = true;
                for (name, value) in parts {
                    if !first {
                        write!(f, ",")?;
                    }
                    write!(f, "{}={}", name, value)?;
                    first = false;
                }
                Ok(())
            }
        }
    }
}

/// A stored document: id, collection, mergeable field tree, and metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Immutable identity.
    pub id: DocumentId,
    /// Collection the document belongs to.
    pub collection: String,
    /// The CRDT field tree.
    pub fields: CrdtMap,
    /// Version vector over every field clock this document has absorbed.
    pub vv: VersionVector,
    /// Cached size estimate in bytes, maintained on every merge.
    pub size: usize,
}

impl Document {
    /// Create an empty document shell (no fields yet).
    pub fn new(collection: impl Into<String>, id: DocumentId, clock: FieldClock) -> Self {
        let fields = CrdtMap::new(clock);
        let size = fields.estimated_size();
        let mut doc = Self {
            id,
            collection: collection.into(),
            fields,
            vv: VersionVector::new(),
            size,
        };
        doc.size += doc.id.estimated_size();
        doc
    }

    /// Resolve a live value at a path. Id fields resolve through the key.
    pub fn get(&self, path: &FieldPath) -> Option<CrdtValue> {
        if path.len() == 1 {
            if let Some(scalar) = self.id.component(&path.0[0]) {
                return Some(CrdtValue::register(scalar, FieldClock::zero()));
            }
        }
        self.fields.get_path(path).cloned()
    }

    /// Read a path as a scalar, if it is one.
    pub fn read_scalar(&self, path: &FieldPath) -> Option<Scalar> {
        self.get(path).and_then(|v| v.read_scalar())
    }

    /// True if the `_deleted` register reads as `true`.
    pub fn is_deleted(&self) -> bool {
        self.read_scalar(&FieldPath::field(TOMBSTONE_FIELD))
            .and_then(|s| s.as_bool())
            .unwrap_or(false)
    }

    /// True if only system fields survive: the outcome of a delete/update
    /// merge race that stripped every application field.
    pub fn is_husked(&self) -> bool {
        self.fields.keys().all(|k| k.starts_with('_')) && self.fields.len() > 0
    }

    /// Recompute the size estimate from scratch. Normally the cached value
    /// is maintained incrementally; this is the slow path for tests.
    pub fn recompute_size(&self) -> usize {
        self.fields.estimated_size() + self.id.estimated_size()
    }

    /// Render the live (non-tombstoned) fields as a JSON value, with
    /// counters read at their current value. System fields are included;
    /// filtering `_deleted` documents is the reader's concern.
    pub fn to_json(&self) -> serde_json::Value {
        fn map_to_json(map: &CrdtMap) -> serde_json::Value {
            let mut obj = serde_json::Map::new();
            for (key, value) in map.iter() {
                obj.insert(key.clone(), value_to_json(value));
            }
            serde_json::Value::Object(obj)
        }
        fn value_to_json(value: &CrdtValue) -> serde_json::Value {
            match value.view() {
                ValueView::Map(m) => map_to_json(m),
                _ => match value.read_scalar() {
                    Some(Scalar::Null) | None => serde_json::Value::Null,
                    Some(Scalar::Bool(b)) => serde_json::Value::Bool(b),
                    Some(Scalar::Int(i)) => serde_json::Value::from(i),
                    Some(Scalar::Float(x)) => serde_json::Value::from(x),
                    Some(Scalar::Text(s)) => serde_json::Value::String(s),
                    Some(Scalar::Attachment(t)) => serde_json::Value::String(t.to_string()),
                },
            }
        }

        let mut root = map_to_json(&self.fields);
        if let serde_json::Value::Object(obj) = &mut root {
            match &self.id {
                DocumentId::Text(s) => {
                    obj.insert("_id".into(), serde_json::Value::String(s.clone()));
                }
                DocumentId::Composite(parts) => {
                    for (name, value) in parts {
                        obj.insert(name.clone(), value_to_json_key(value));
                    }
                }
            }
        }
        root
    }
}

fn value_to_json_key(value: &KeyScalar) -> serde_json::Value {
    match value {
        KeyScalar::Null => serde_json::Value::Null,
        KeyScalar::Bool(b) => serde_json::Value::Bool(*b),
        KeyScalar::Int(i) => serde_json::Value::from(*i),
        KeyScalar::Text(s) => serde_json::Value::String(s.clone()),
    }
}
