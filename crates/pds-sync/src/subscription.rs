//! Subscription registry.
//!
//! A subscription declares which documents this peer is willing to store
//! and relay: `(collection, predicate, parameters)`. Predicates here are
//! evaluated against the FULL document, tombstone field included -
//! registration rejects predicates that filter on the tombstone field,
//! because a peer that never stores a tombstone can never relay it to a
//! third peer in a multi-hop mesh. User-visible filtering of deleted
//! documents belongs to observers and ad-hoc queries.

use crate::error::SyncError;
use parking_lot::{Mutex, RwLock};
use pds_query::ast::Expr;
use pds_query::{eval, parse_statement, Params, Statement};
use pds_store::{Document, TOMBSTONE_FIELD};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What a subscription asks for. Serializable: the descriptor set travels
/// to peers during handshake.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionDescriptor {
    pub collection: String,
    pub predicate: Option<Expr>,
    pub params: Params,
}

impl SubscriptionDescriptor {
    pub fn new(collection: impl Into<String>, predicate: Option<Expr>, params: Params) -> Self {
        Self {
            collection: collection.into(),
            predicate,
            params,
        }
    }

    /// Build from a SELECT statement string.
    pub fn from_select(src: &str, params: Params) -> Result<Self, SyncError> {
        match parse_statement(src)? {
            Statement::Select(select) => Ok(Self {
                collection: select.collection,
                predicate: select.predicate,
                params,
            }),
            _ => Err(SyncError::NotASelect),
        }
    }

    /// Reject tombstone-filtering predicates (the multi-hop relay rule).
    pub fn validate(&self) -> Result<(), SyncError> {
        if let Some(predicate) = &self.predicate {
            if predicate.references_field(TOMBSTONE_FIELD) {
                return Err(SyncError::TombstoneExcluded);
            }
        }
        Ok(())
    }

    /// Evaluate against the full document, tombstones included.
    pub fn matches(&self, doc: &Document) -> bool {
        doc.collection == self.collection
            && eval::matches(self.predicate.as_ref(), doc, &self.params)
    }
}

/// Subscription lifecycle. `Cancelled` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    Pending,
    Active,
    Cancelled,
}

struct SubscriptionEntry {
    descriptor: SubscriptionDescriptor,
    state: SubscriptionState,
    /// Coalesced consumers sharing this subscription.
    consumers: usize,
}

/// Registry of this node's subscriptions.
pub struct SubscriptionManager {
    entries: RwLock<HashMap<u64, SubscriptionEntry>>,
    next_id: AtomicU64,
    /// Descriptors cancelled recently, for churn detection.
    recently_cancelled: Mutex<HashMap<String, Instant>>,
    churn_window: Duration,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::with_churn_window(Duration::from_secs(30))
    }

    pub fn with_churn_window(churn_window: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            recently_cancelled: Mutex::new(HashMap::new()),
            churn_window,
        }
    }

    /// Register a subscription.
    ///
    /// Identical descriptors coalesce into one underlying subscription;
    /// re-registering a descriptor cancelled moments ago is flagged as
    /// mesh churn (subscriptions should be long-lived).
    pub fn register(
        self: &Arc<Self>,
        descriptor: SubscriptionDescriptor,
    ) -> Result<SubscriptionHandle, SyncError> {
        descriptor.validate()?;

        let churn_key = descriptor_key(&descriptor);
        {
            let mut recent = self.recently_cancelled.lock();
            recent.retain(|_, at| at.elapsed() < self.churn_window);
            if recent.remove(&churn_key).is_some() {
                tracing::warn!(
                    collection = %descriptor.collection,
                    "rapid subscription create/cancel cycle; subscriptions should be long-lived"
                );
            }
        }

        let mut entries = self.entries.write();
        // Coalesce with a live identical subscription
        for (id, entry) in entries.iter_mut() {
            if entry.state != SubscriptionState::Cancelled && entry.descriptor == descriptor {
                entry.consumers += 1;
                return Ok(SubscriptionHandle::new(*id, self.clone()));
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        entries.insert(
            id,
            SubscriptionEntry {
                descriptor: descriptor.clone(),
                state: SubscriptionState::Pending,
                consumers: 1,
            },
        );
        tracing::info!(id, collection = %descriptor.collection, "subscription registered");
        Ok(SubscriptionHandle::new(id, self.clone()))
    }

    /// Register from a SELECT statement string.
    pub fn register_select(
        self: &Arc<Self>,
        src: &str,
        params: Params,
    ) -> Result<SubscriptionHandle, SyncError> {
        self.register(SubscriptionDescriptor::from_select(src, params)?)
    }

    /// Move every pending subscription to `Active` (link established).
    pub fn activate_pending(&self) {
        let mut entries = self.entries.write();
        for (id, entry) in entries.iter_mut() {
            if entry.state == SubscriptionState::Pending {
                entry.state = SubscriptionState::Active;
                tracing::info!(id, "subscription active");
            }
        }
    }

    pub fn state(&self, id: u64) -> Option<SubscriptionState> {
        self.entries.read().get(&id).map(|e| e.state)
    }

    /// Live (pending or active) descriptors, for the handshake.
    pub fn descriptors(&self) -> Vec<SubscriptionDescriptor> {
        let entries = self.entries.read();
        let mut live: Vec<_> = entries
            .iter()
            .filter(|(_, e)| e.state != SubscriptionState::Cancelled)
            .collect();
        live.sort_by_key(|(id, _)| **id);
        live.into_iter().map(|(_, e)| e.descriptor.clone()).collect()
    }

    /// True if any live subscription wants this document.
    pub fn wants(&self, doc: &Document) -> bool {
        self.entries
            .read()
            .values()
            .filter(|e| e.state != SubscriptionState::Cancelled)
            .any(|e| e.descriptor.matches(doc))
    }

    /// Cancel every live subscription on `collection` whose predicate the
    /// caller deems unsafe, returning the cancelled descriptors so they
    /// can be recreated in refined form. Used by the eviction manager.
    pub fn cancel_where(
        &self,
        mut unsafe_predicate: impl FnMut(&SubscriptionDescriptor) -> bool,
    ) -> Vec<SubscriptionDescriptor> {
        let mut cancelled = Vec::new();
        let mut entries = self.entries.write();
        for (id, entry) in entries.iter_mut() {
            if entry.state != SubscriptionState::Cancelled && unsafe_predicate(&entry.descriptor) {
                entry.state = SubscriptionState::Cancelled;
                entry.consumers = 0;
                cancelled.push(entry.descriptor.clone());
                tracing::info!(id, "subscription cancelled for eviction coordination");
            }
        }
        for descriptor in &cancelled {
            self.recently_cancelled
                .lock()
                .insert(descriptor_key(descriptor), Instant::now());
        }
        cancelled
    }

    fn release(&self, id: u64) {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(&id) else {
            return;
        };
        if entry.state == SubscriptionState::Cancelled {
            return;
        }
        entry.consumers = entry.consumers.saturating_sub(1);
        if entry.consumers == 0 {
            entry.state = SubscriptionState::Cancelled;
            let key = descriptor_key(&entry.descriptor);
            self.recently_cancelled.lock().insert(key, Instant::now());
            tracing::info!(id, "subscription cancelled");
        }
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

fn descriptor_key(descriptor: &SubscriptionDescriptor) -> String {
    serde_json::to_string(descriptor).unwrap_or_default()
}

/// Caller-held handle. Cancellation is synchronous and idempotent; once
/// every coalesced handle is gone the subscription is cancelled for good.
pub struct SubscriptionHandle {
    id: u64,
    manager: Arc<SubscriptionManager>,
    cancelled: AtomicBool,
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("cancelled", &self.cancelled)
            .finish_non_exhaustive()
    }
}

impl SubscriptionHandle {
    fn new(id: u64, manager: Arc<SubscriptionManager>) -> Self {
        Self {
            id,
            manager,
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SubscriptionState {
        self.manager
            .state(self.id)
            .unwrap_or(SubscriptionState::Cancelled)
    }

    /// Cancel this consumer's interest. Returns synchronously; calling
    /// again is a no-op.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.manager.release(self.id);
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<SubscriptionManager> {
        Arc::new(SubscriptionManager::with_churn_window(Duration::from_secs(
            60,
        )))
    }

    #[test]
    fn test_register_and_lifecycle() {
        let manager = manager();
        let handle = manager
            .register_select("SELECT * FROM orders WHERE region = 'eu'", Params::new())
            .unwrap();
        assert_eq!(handle.state(), SubscriptionState::Pending);

        manager.activate_pending();
        assert_eq!(handle.state(), SubscriptionState::Active);

        handle.cancel();
        assert_eq!(handle.state(), SubscriptionState::Cancelled);
        // Idempotent
        handle.cancel();
        assert_eq!(handle.state(), SubscriptionState::Cancelled);
    }

    #[test]
    fn test_tombstone_filter_rejected() {
        let manager = manager();
        let err = manager
            .register_select(
                "SELECT * FROM orders WHERE _deleted = FALSE",
                Params::new(),
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::TombstoneExcluded));

        // Even buried in a compound predicate
        let err = manager
            .register_select(
                "SELECT * FROM orders WHERE region = 'eu' AND NOT _deleted = TRUE",
                Params::new(),
            )
            .unwrap_err();
        assert!(matches!(err, SyncError::TombstoneExcluded));
    }

    #[test]
    fn test_identical_descriptors_coalesce() {
        let manager = manager();
        let h1 = manager
            .register_select("SELECT * FROM orders", Params::new())
            .unwrap();
        let h2 = manager
            .register_select("SELECT * FROM orders", Params::new())
            .unwrap();
        assert_eq!(h1.id(), h2.id());
        assert_eq!(manager.descriptors().len(), 1);

        // Cancelling one consumer keeps the subscription alive
        h1.cancel();
        assert_eq!(h2.state(), SubscriptionState::Pending);
        h2.cancel();
        assert_eq!(h2.state(), SubscriptionState::Cancelled);
    }

    #[test]
    fn test_cancel_where_returns_descriptors() {
        let manager = manager();
        let _h1 = manager
            .register_select("SELECT * FROM orders", Params::new())
            .unwrap();
        let _h2 = manager
            .register_select("SELECT * FROM stock", Params::new())
            .unwrap();

        let cancelled = manager.cancel_where(|d| d.collection == "orders");
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].collection, "orders");
        assert_eq!(manager.descriptors().len(), 1);
    }
}
