//! Lazily materialized result cursors.
//!
//! A delivered snapshot hands the consumer cursors, not values. The
//! consumer extracts what it needs during the callback; once the callback
//! returns, the pipeline invalidates every cursor, so retaining one past
//! the callback yields nothing rather than a stale or leaked document.

use parking_lot::Mutex;
use pds_core::path::FieldPath;
use pds_core::scalar::Scalar;
use pds_query::ast::Projection;
use pds_store::Document;
use std::sync::Arc;

/// One result item, materialized on demand.
#[derive(Clone)]
pub struct ResultCursor {
    slot: Arc<Mutex<Option<Document>>>,
    projection: Arc<Projection>,
}

impl ResultCursor {
    pub(crate) fn new(doc: Document, projection: Arc<Projection>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(doc))),
            projection,
        }
    }

    pub(crate) fn invalidate(&self) {
        self.slot.lock().take();
    }

    /// True once the pipeline has reclaimed the underlying document.
    pub fn is_invalidated(&self) -> bool {
        self.slot.lock().is_none()
    }

    /// Materialize the projected row. `None` after invalidation.
    pub fn materialize(&self) -> Option<serde_json::Value> {
        let slot = self.slot.lock();
        slot.as_ref()
            .map(|doc| pds_query::exec::project(doc, &self.projection))
    }

    /// Read one scalar field without materializing the whole row.
    pub fn scalar(&self, path: &str) -> Option<Scalar> {
        let slot = self.slot.lock();
        slot.as_ref()
            .and_then(|doc| doc.read_scalar(&FieldPath::parse(path)))
    }
}

/// An immutable view of the query result at one store revision.
pub struct ResultSnapshot {
    revision: u64,
    items: Vec<ResultCursor>,
}

impl ResultSnapshot {
    pub(crate) fn new(revision: u64, items: Vec<ResultCursor>) -> Self {
        Self { revision, items }
    }

    /// Store revision this snapshot was computed at.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResultCursor> {
        self.items.iter()
    }

    pub(crate) fn cursors(&self) -> Vec<ResultCursor> {
        self.items.clone()
    }
}
