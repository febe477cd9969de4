//! The document store.
//!
//! Single source of truth for persisted CRDT state. Merge application is
//! serialized per document (one write lock per document entry) while
//! unrelated documents merge in parallel; reads clone a fully merged
//! snapshot and never observe a partially applied delta. Every applied
//! mutation lands in the delta log, which the replication layer drains;
//! eviction removes entries without logging anything.

use crate::delta::{DocumentDelta, MergeOutcome};
use crate::document::{Document, DocumentId};
use crate::error::StoreError;
use parking_lot::{Mutex, RwLock};
use pds_core::clock::{FieldClock, VersionVector, WriterId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Size thresholds and log bounds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Documents above this size are flagged with a warning (bytes).
    pub soft_size_limit: usize,
    /// Mutations pushing a document above this size are rejected (bytes).
    pub hard_size_limit: usize,
    /// Maximum retained delta-log entries before the oldest are dropped.
    pub max_log_entries: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            soft_size_limit: 250 * 1024,
            hard_size_limit: 5 * 1024 * 1024,
            max_log_entries: 4096,
        }
    }
}

/// A delta as recorded in the replication log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggedDelta {
    /// Store-local log sequence number.
    pub seq: u64,
    pub delta: DocumentDelta,
}

/// What kind of local change a notice describes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    /// A merge changed (or created) the document.
    Merged,
    /// The document was evicted from local storage.
    Evicted,
}

/// Notification delivered to registered change listeners after a commit.
#[derive(Clone, Debug)]
pub struct ChangeNotice {
    pub collection: String,
    pub id: DocumentId,
    pub revision: u64,
    pub kind: ChangeKind,
}

/// Counters exposed for monitoring.
#[derive(Clone, Debug, Default)]
pub struct StoreStats {
    pub documents: usize,
    pub revision: u64,
    pub merges_applied: u64,
    pub merges_unchanged: u64,
    pub size_rejections: u64,
}

type ChangeListener = Box<dyn Fn(&ChangeNotice) + Send + Sync>;
type DocKey = (String, DocumentId);

/// The local node's document store.
pub struct DocumentStore {
    writer: WriterId,
    config: StoreConfig,
    documents: RwLock<HashMap<DocKey, Arc<RwLock<Document>>>>,
    /// Lamport counter: strictly above every clock this store has seen.
    clock: AtomicU64,
    /// Bumped on every state-changing commit.
    revision: AtomicU64,
    log_seq: AtomicU64,
    delta_log: Mutex<VecDeque<LoggedDelta>>,
    listeners: RwLock<Vec<ChangeListener>>,
    merges_applied: AtomicU64,
    merges_unchanged: AtomicU64,
    size_rejections: AtomicU64,
}

impl DocumentStore {
    pub fn new(writer: WriterId, config: StoreConfig) -> Self {
        Self {
            writer,
            config,
            documents: RwLock::new(HashMap::new()),
            clock: AtomicU64::new(0),
            revision: AtomicU64::new(0),
            log_seq: AtomicU64::new(0),
            delta_log: Mutex::new(VecDeque::new()),
            listeners: RwLock::new(Vec::new()),
            merges_applied: AtomicU64::new(0),
            merges_unchanged: AtomicU64::new(0),
            size_rejections: AtomicU64::new(0),
        }
    }

    /// This store's writer identity.
    pub fn writer(&self) -> &WriterId {
        &self.writer
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Next local clock for a mutation produced by this writer.
    pub fn next_clock(&self) -> FieldClock {
        let counter = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        FieldClock::new(counter, self.writer.clone())
    }

    /// Current store revision (bumped on every state-changing commit).
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    /// Register a listener invoked after each commit, outside all locks.
    pub fn add_listener(&self, listener: ChangeListener) {
        self.listeners.write().push(listener);
    }

    /// Apply a delta (local or remote) as a CRDT merge.
    ///
    /// Serialized per document: the document's write lock is held for the
    /// merge and size check only, never across listener callbacks. A
    /// rejected mutation leaves the prior state untouched.
    pub fn apply(&self, delta: &DocumentDelta) -> Result<MergeOutcome, StoreError> {
        if delta.is_empty() {
            return Ok(MergeOutcome::Unchanged);
        }

        // Keep the Lamport clock above everything we have seen.
        let seen = delta.max_clock().counter;
        self.clock.fetch_max(seen, Ordering::SeqCst);

        let key = (delta.collection.clone(), delta.id.clone());
        let (entry, created) = {
            let mut documents = self.documents.write();
            match documents.get(&key) {
                Some(entry) => (entry.clone(), false),
                None => {
                    let doc = Document::new(
                        delta.collection.clone(),
                        delta.id.clone(),
                        delta.max_clock(),
                    );
                    let entry = Arc::new(RwLock::new(doc));
                    documents.insert(key, entry.clone());
                    (entry, true)
                }
            }
        };

        let outcome = {
            let mut doc = entry.write();

            // Merge into a scratch tree first so the size ceiling can
            // reject the mutation without touching committed state.
            let mut merged = doc.fields.clone();
            for (path, value) in &delta.fields {
                merged.merge_at(path, value.clone());
            }
            let new_size = merged.estimated_size() + doc.id.estimated_size();
            if new_size > self.config.hard_size_limit {
                self.size_rejections.fetch_add(1, Ordering::Relaxed);
                return Err(StoreError::SizeLimitExceeded {
                    id: doc.id.clone(),
                    size: new_size,
                    limit: self.config.hard_size_limit,
                });
            }

            if !created && merged == doc.fields {
                self.merges_unchanged.fetch_add(1, Ordering::Relaxed);
                MergeOutcome::Unchanged
            } else {
                let crossed_soft =
                    doc.size <= self.config.soft_size_limit && new_size > self.config.soft_size_limit;
                doc.fields = merged;
                doc.size = new_size;
                for (_, value) in &delta.fields {
                    doc.vv.observe(&value.type_clock());
                }
                if crossed_soft {
                    tracing::warn!(
                        id = %doc.id,
                        collection = %doc.collection,
                        size = new_size,
                        limit = self.config.soft_size_limit,
                        "document crossed the soft size threshold"
                    );
                }
                if doc.is_husked() {
                    // A delete/update race stripped every application field
                    tracing::debug!(id = %doc.id, collection = %doc.collection, "document husked");
                }
                if created {
                    MergeOutcome::Created
                } else {
                    MergeOutcome::Updated
                }
            }
        };

        if outcome == MergeOutcome::Unchanged {
            return Ok(outcome);
        }

        self.merges_applied.fetch_add(1, Ordering::Relaxed);
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        self.append_log(delta.clone());
        self.notify(&ChangeNotice {
            collection: delta.collection.clone(),
            id: delta.id.clone(),
            revision,
            kind: ChangeKind::Merged,
        });
        Ok(outcome)
    }

    /// Clone a consistent snapshot of one document.
    pub fn snapshot(&self, collection: &str, id: &DocumentId) -> Option<Document> {
        let entry = {
            let documents = self.documents.read();
            documents.get(&(collection.to_string(), id.clone())).cloned()
        };
        entry.map(|e| e.read().clone())
    }

    /// Clone consistent snapshots of every document in a collection.
    /// Each document is locked individually; the scan as a whole is not a
    /// cross-document transaction (the store offers none).
    pub fn scan(&self, collection: &str) -> Vec<Document> {
        let entries: Vec<_> = {
            let documents = self.documents.read();
            documents
                .iter()
                .filter(|((coll, _), _)| coll == collection)
                .map(|(_, entry)| entry.clone())
                .collect()
        };
        let mut docs: Vec<Document> = entries.iter().map(|e| e.read().clone()).collect();
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        docs
    }

    pub fn contains(&self, collection: &str, id: &DocumentId) -> bool {
        self.documents
            .read()
            .contains_key(&(collection.to_string(), id.clone()))
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }

    /// Names of all collections currently holding documents.
    pub fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .documents
            .read()
            .keys()
            .map(|(coll, _)| coll.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Version vector over everything this store has absorbed.
    pub fn version_vector(&self) -> VersionVector {
        let entries: Vec<_> = {
            let documents = self.documents.read();
            documents.values().cloned().collect()
        };
        let mut vv = VersionVector::new();
        for entry in entries {
            vv.merge(&entry.read().vv);
        }
        vv
    }

    /// Per-document version summaries, the negotiation currency for the
    /// replication layer.
    pub fn document_heads(&self) -> Vec<(String, DocumentId, VersionVector)> {
        let entries: Vec<_> = {
            let documents = self.documents.read();
            documents.values().cloned().collect()
        };
        let mut heads: Vec<_> = entries
            .iter()
            .map(|entry| {
                let doc = entry.read();
                (doc.collection.clone(), doc.id.clone(), doc.vv.clone())
            })
            .collect();
        heads.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
        heads
    }

    /// Physically remove a document. No merge happens, no delta is logged,
    /// nothing replicates: this is the eviction path only.
    pub fn evict(&self, collection: &str, id: &DocumentId) -> bool {
        let removed = {
            let mut documents = self.documents.write();
            documents.remove(&(collection.to_string(), id.clone()))
        };
        if removed.is_some() {
            let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::debug!(%id, collection, "evicted document from local storage");
            self.notify(&ChangeNotice {
                collection: collection.to_string(),
                id: id.clone(),
                revision,
                kind: ChangeKind::Evicted,
            });
            true
        } else {
            false
        }
    }

    /// Delta-log entries with `seq > since`, oldest first.
    pub fn log_since(&self, since: u64) -> Vec<LoggedDelta> {
        self.delta_log
            .lock()
            .iter()
            .filter(|entry| entry.seq > since)
            .cloned()
            .collect()
    }

    /// Highest log sequence number issued so far.
    pub fn log_head(&self) -> u64 {
        self.log_seq.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            documents: self.len(),
            revision: self.revision(),
            merges_applied: self.merges_applied.load(Ordering::Relaxed),
            merges_unchanged: self.merges_unchanged.load(Ordering::Relaxed),
            size_rejections: self.size_rejections.load(Ordering::Relaxed),
        }
    }

    fn append_log(&self, delta: DocumentDelta) {
        let seq = self.log_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let mut log = self.delta_log.lock();
        log.push_back(LoggedDelta { seq, delta });
        while log.len() > self.config.max_log_entries {
            log.pop_front();
        }
    }

    fn notify(&self, notice: &ChangeNotice) {
        let listeners = self.listeners.read();
        for listener in listeners.iter() {
            listener(notice);
        }
    }
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore")
            .field("writer", &self.writer)
            .field("documents", &self.len())
            .field("revision", &self.revision())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pds_core::path::FieldPath;
    use pds_core::value::CrdtValue;

    fn store() -> DocumentStore {
        DocumentStore::new(WriterId::new("local"), StoreConfig::default())
    }

    fn simple_delta(store: &DocumentStore, id: &str, field: &str, value: i64) -> DocumentDelta {
        let mut delta = DocumentDelta::new("orders", DocumentId::text(id));
        delta.push(
            FieldPath::field(field),
            CrdtValue::register(value, store.next_clock()),
        );
        delta
    }

    #[test]
    fn test_apply_creates_then_updates() {
        let store = store();
        let d1 = simple_delta(&store, "o1", "total", 10);
        assert_eq!(store.apply(&d1).unwrap(), MergeOutcome::Created);

        let d2 = simple_delta(&store, "o1", "total", 20);
        assert_eq!(store.apply(&d2).unwrap(), MergeOutcome::Updated);

        let doc = store.snapshot("orders", &DocumentId::text("o1")).unwrap();
        assert_eq!(
            doc.read_scalar(&FieldPath::field("total")),
            Some(pds_core::scalar::Scalar::Int(20))
        );
        // The incrementally maintained size matches a full recount
        assert_eq!(doc.size, doc.recompute_size());
    }

    #[test]
    fn test_apply_is_idempotent_and_unlogged_on_replay() {
        let store = store();
        let delta = simple_delta(&store, "o1", "total", 10);
        store.apply(&delta).unwrap();
        let head = store.log_head();
        let revision = store.revision();

        // Replaying the same delta changes nothing and logs nothing
        assert_eq!(store.apply(&delta).unwrap(), MergeOutcome::Unchanged);
        assert_eq!(store.log_head(), head);
        assert_eq!(store.revision(), revision);
    }

    #[test]
    fn test_size_ceiling_rejects_before_merge() {
        let store = DocumentStore::new(
            WriterId::new("local"),
            StoreConfig {
                soft_size_limit: 64,
                hard_size_limit: 256,
                ..Default::default()
            },
        );
        let small = simple_delta(&store, "o1", "total", 1);
        store.apply(&small).unwrap();
        let before = store.snapshot("orders", &DocumentId::text("o1")).unwrap();

        let mut big = DocumentDelta::new("orders", DocumentId::text("o1"));
        big.push(
            FieldPath::field("blob"),
            CrdtValue::register("x".repeat(4096), store.next_clock()),
        );
        let err = store.apply(&big).unwrap_err();
        assert!(matches!(err, StoreError::SizeLimitExceeded { .. }));

        // Prior state untouched
        let after = store.snapshot("orders", &DocumentId::text("o1")).unwrap();
        assert_eq!(before.fields, after.fields);
        assert_eq!(store.stats().size_rejections, 1);
    }

    #[test]
    fn test_default_hard_ceiling_rejects_five_megabytes() {
        let store = store();
        let seeded = simple_delta(&store, "o1", "total", 1);
        store.apply(&seeded).unwrap();
        let before = store.snapshot("orders", &DocumentId::text("o1")).unwrap();

        // A little over 5 MB of payload against the default limits
        let mut oversized = DocumentDelta::new("orders", DocumentId::text("o1"));
        oversized.push(
            FieldPath::field("payload"),
            CrdtValue::register("x".repeat(5 * 1024 * 1024 + 100 * 1024), store.next_clock()),
        );
        let err = store.apply(&oversized).unwrap_err();
        assert!(matches!(err, StoreError::SizeLimitExceeded { .. }));

        let after = store.snapshot("orders", &DocumentId::text("o1")).unwrap();
        assert_eq!(before.fields, after.fields);
        assert_eq!(before.size, after.size);
    }

    #[test]
    fn test_concurrent_field_merge_order_independent() {
        // Two stores, cross-applied in opposite orders, converge.
        let a = DocumentStore::new(WriterId::new("a"), StoreConfig::default());
        let b = DocumentStore::new(WriterId::new("b"), StoreConfig::default());

        let base = simple_delta(&a, "o1", "status", 0);
        a.apply(&base).unwrap();
        b.apply(&base).unwrap();

        let mut from_a = DocumentDelta::new("orders", DocumentId::text("o1"));
        from_a.push(
            FieldPath::field("status"),
            CrdtValue::register("shipped", a.next_clock()),
        );
        let mut from_b = DocumentDelta::new("orders", DocumentId::text("o1"));
        from_b.push(
            FieldPath::field("total"),
            CrdtValue::register(42i64, b.next_clock()),
        );

        a.apply(&from_a).unwrap();
        a.apply(&from_b).unwrap();
        b.apply(&from_b).unwrap();
        b.apply(&from_a).unwrap();

        let doc_a = a.snapshot("orders", &DocumentId::text("o1")).unwrap();
        let doc_b = b.snapshot("orders", &DocumentId::text("o1")).unwrap();
        assert_eq!(doc_a.fields, doc_b.fields);
        assert_eq!(
            doc_a.read_scalar(&FieldPath::field("status")),
            Some(pds_core::scalar::Scalar::Text("shipped".into()))
        );
        assert_eq!(
            doc_a.read_scalar(&FieldPath::field("total")),
            Some(pds_core::scalar::Scalar::Int(42))
        );
    }

    #[test]
    fn test_evict_logs_no_delta() {
        let store = store();
        let delta = simple_delta(&store, "o1", "total", 10);
        store.apply(&delta).unwrap();
        let head = store.log_head();

        assert!(store.evict("orders", &DocumentId::text("o1")));
        assert!(!store.contains("orders", &DocumentId::text("o1")));
        // Eviction is local-only: nothing entered the replication log
        assert_eq!(store.log_head(), head);

        // Idempotent
        assert!(!store.evict("orders", &DocumentId::text("o1")));
    }

    #[test]
    fn test_listener_sees_commits() {
        use std::sync::atomic::AtomicUsize;
        let store = store();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        store.add_listener(Box::new(move |notice| {
            if notice.kind == ChangeKind::Merged {
                seen_clone.fetch_add(1, Ordering::SeqCst);
            }
        }));

        store.apply(&simple_delta(&store, "o1", "x", 1)).unwrap();
        store.apply(&simple_delta(&store, "o2", "x", 1)).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
