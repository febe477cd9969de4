//! The observer pipeline.
//!
//! Observers are local live queries with a credit-based backpressure
//! contract: after a snapshot is delivered, the next delivery is withheld
//! until the consumer grants credit. Pending work is a single slot (a
//! newer snapshot replaces the one waiting, never queues behind it), so a
//! stalled consumer costs one buffered snapshot, not unbounded memory.
//!
//! The callback's job is to extract values from the cursors and grant
//! credit promptly; heavy processing belongs on the consumer's own tasks.
//! Cursors are invalidated the moment the callback returns. Cancellation
//! is synchronous: once `cancel()` returns, no further callback runs.
//! (Consequently, calling `cancel()` from inside the callback deadlocks.)

use crate::cursor::{ResultCursor, ResultSnapshot};
use parking_lot::{Mutex, RwLock};
use pds_query::ast::{Projection, SelectStatement};
use pds_query::{parse_statement, Params, QueryError, QueryExecutor, Statement};
use pds_store::ChangeNotice;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Notify, Semaphore};

#[derive(Error, Debug)]
pub enum ObserveError {
    #[error("observer query must be a SELECT")]
    NotASelect,

    #[error("observer queries cannot use aggregate projections")]
    AggregatesUnsupported,

    #[error(transparent)]
    Query(#[from] QueryError),
}

/// Pipeline tunables.
#[derive(Clone, Debug)]
pub struct ObserverConfig {
    /// How long to wait for credit before logging a backpressure overflow
    /// and switching the observer to latest-only delivery.
    pub credit_window: Duration,
    /// Deliver the current result once at registration.
    pub initial_delivery: bool,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            credit_window: Duration::from_secs(5),
            initial_delivery: true,
        }
    }
}

/// Handed to the callback alongside each snapshot. Granting credit
/// releases the next delivery; granting twice is a no-op.
pub struct CreditGrant {
    credit: Arc<Semaphore>,
    granted: AtomicBool,
}

impl CreditGrant {
    fn new(credit: Arc<Semaphore>) -> Self {
        Self {
            credit,
            granted: AtomicBool::new(false),
        }
    }

    /// Signal readiness for the next snapshot.
    pub fn grant(&self) {
        if !self.granted.swap(true, Ordering::SeqCst) {
            self.credit.add_permits(1);
        }
    }
}

/// Per-observer delivery counters.
#[derive(Clone, Debug, Default)]
pub struct ObserverStats {
    pub deliveries: u64,
    /// Snapshots replaced in the pending slot before delivery.
    pub pending_replaced: u64,
    /// Credit-window overflows (degraded to latest-only).
    pub overflows: u64,
}

type Callback = Box<dyn Fn(ResultSnapshot, CreditGrant) + Send + Sync>;

struct ObserverInner {
    id: u64,
    select: SelectStatement,
    params: Params,
    projection: Arc<Projection>,
    callback: Mutex<Option<Callback>>,
    /// The bounded mailbox: at most one pending snapshot.
    pending: Mutex<Option<(u64, Vec<pds_store::Document>)>>,
    wakeup: Notify,
    credit: Arc<Semaphore>,
    cancelled: AtomicBool,
    latest_only: AtomicBool,
    deliveries: AtomicU64,
    pending_replaced: AtomicU64,
    overflows: AtomicU64,
}

impl ObserverInner {
    /// Place a fresh result in the pending slot, replacing any snapshot
    /// still waiting there.
    fn offer(&self, revision: u64, docs: Vec<pds_store::Document>) {
        if self.cancelled.load(Ordering::SeqCst) {
            return;
        }
        let replaced = {
            let mut pending = self.pending.lock();
            pending.replace((revision, docs)).is_some()
        };
        if replaced {
            self.pending_replaced.fetch_add(1, Ordering::Relaxed);
        }
        self.wakeup.notify_one();
    }
}

type ObserverMap = Arc<RwLock<HashMap<u64, Arc<ObserverInner>>>>;

/// Subscribes to store changes and drives observer deliveries.
pub struct ObserverPipeline {
    exec: QueryExecutor,
    config: ObserverConfig,
    observers: ObserverMap,
    next_id: AtomicU64,
    dispatcher: tokio::task::JoinHandle<()>,
}

impl ObserverPipeline {
    /// Create the pipeline and hook it into the store's change feed.
    /// Must be called within a tokio runtime.
    pub fn new(exec: QueryExecutor, config: ObserverConfig) -> Self {
        let observers: ObserverMap = Arc::new(RwLock::new(HashMap::new()));

        let (notice_tx, notice_rx) = mpsc::unbounded_channel::<ChangeNotice>();
        exec.store().add_listener(Box::new(move |notice| {
            let _ = notice_tx.send(notice.clone());
        }));

        let dispatcher = tokio::spawn(dispatch_loop(
            notice_rx,
            observers.clone(),
            exec.clone(),
        ));

        Self {
            exec,
            config,
            observers,
            next_id: AtomicU64::new(0),
            dispatcher,
        }
    }

    /// Register a live query. The callback runs on the pipeline's
    /// delivery task with an immutable snapshot; no storage lock is held
    /// across it.
    pub fn register_observer(
        &self,
        query: &str,
        params: Params,
        callback: Callback,
    ) -> Result<ObserverHandle, ObserveError> {
        let select = match parse_statement(query)? {
            Statement::Select(select) => select,
            _ => return Err(ObserveError::NotASelect),
        };
        if matches!(select.projection, Projection::Aggregates(_)) {
            return Err(ObserveError::AggregatesUnsupported);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = Arc::new(ObserverInner {
            id,
            projection: Arc::new(select.projection.clone()),
            select,
            params,
            callback: Mutex::new(Some(callback)),
            pending: Mutex::new(None),
            wakeup: Notify::new(),
            credit: Arc::new(Semaphore::new(1)),
            cancelled: AtomicBool::new(false),
            latest_only: AtomicBool::new(false),
            deliveries: AtomicU64::new(0),
            pending_replaced: AtomicU64::new(0),
            overflows: AtomicU64::new(0),
        });

        self.observers.write().insert(id, inner.clone());
        let task = tokio::spawn(delivery_loop(inner.clone(), self.config.clone()));

        if self.config.initial_delivery {
            run_query(&self.exec, &inner);
        }

        tracing::info!(id, collection = %inner.select.collection, "observer registered");
        Ok(ObserverHandle {
            inner,
            observers: self.observers.clone(),
            task,
        })
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }
}

impl Drop for ObserverPipeline {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

/// Re-run an observer's query and offer the result.
fn run_query(exec: &QueryExecutor, inner: &Arc<ObserverInner>) {
    match exec.select_documents(&inner.select, &inner.params) {
        Ok((docs, _)) => inner.offer(exec.store().revision(), docs),
        Err(err) => {
            tracing::warn!(id = inner.id, error = %err, "observer query failed");
        }
    }
}

/// Fan store change notices out to the observers they affect. Queued
/// notices are drained and coalesced per collection before querying, so a
/// burst of mutations costs one re-query per observer, not one per write.
async fn dispatch_loop(
    mut notices: mpsc::UnboundedReceiver<ChangeNotice>,
    observers: ObserverMap,
    exec: QueryExecutor,
) {
    while let Some(first) = notices.recv().await {
        let mut collections = std::collections::HashSet::new();
        collections.insert(first.collection);
        while let Ok(notice) = notices.try_recv() {
            collections.insert(notice.collection);
        }

        let affected: Vec<Arc<ObserverInner>> = {
            let observers = observers.read();
            observers
                .values()
                .filter(|inner| collections.contains(&inner.select.collection))
                .cloned()
                .collect()
        };
        for inner in affected {
            run_query(&exec, &inner);
        }
    }
}

/// One observer's delivery loop: wait for work, wait for credit, deliver,
/// invalidate.
async fn delivery_loop(inner: Arc<ObserverInner>, config: ObserverConfig) {
    loop {
        inner.wakeup.notified().await;
        if inner.cancelled.load(Ordering::SeqCst) {
            return;
        }

        // Credit gate. Overrunning the window is the backpressure-overflow
        // condition: logged, counted, and the observer degrades to
        // latest-only delivery (which the single pending slot already
        // enforces) instead of queuing.
        let permit = match inner.credit.try_acquire() {
            Ok(permit) => Ok(permit),
            Err(_) => {
                match tokio::time::timeout(config.credit_window, inner.credit.acquire()).await {
                    Ok(acquired) => acquired,
                    Err(_) => {
                        if !inner.latest_only.swap(true, Ordering::SeqCst) {
                            inner.overflows.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(
                                id = inner.id,
                                "backpressure overflow: consumer has not granted credit; \
                                 degrading to latest-only delivery"
                            );
                        }
                        inner.credit.acquire().await
                    }
                }
            }
        };
        let Ok(permit) = permit else {
            return; // semaphore closed
        };
        permit.forget();

        if inner.cancelled.load(Ordering::SeqCst) {
            return;
        }
        let Some((revision, docs)) = inner.pending.lock().take() else {
            // Spurious wakeup or the slot was consumed already; return the
            // credit we took.
            inner.credit.add_permits(1);
            continue;
        };

        let cursors: Vec<ResultCursor> = docs
            .into_iter()
            .map(|doc| ResultCursor::new(doc, inner.projection.clone()))
            .collect();
        let snapshot = ResultSnapshot::new(revision, cursors.clone());

        {
            let callback = inner.callback.lock();
            if let Some(callback) = callback.as_ref() {
                callback(snapshot, CreditGrant::new(inner.credit.clone()));
                inner.deliveries.fetch_add(1, Ordering::SeqCst);
            }
        }

        // The callback has returned; the cursors are dead now.
        for cursor in &cursors {
            cursor.invalidate();
        }
    }
}

/// Caller-held observer handle.
pub struct ObserverHandle {
    inner: Arc<ObserverInner>,
    observers: ObserverMap,
    task: tokio::task::JoinHandle<()>,
}

impl ObserverHandle {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn stats(&self) -> ObserverStats {
        ObserverStats {
            deliveries: self.inner.deliveries.load(Ordering::SeqCst),
            pending_replaced: self.inner.pending_replaced.load(Ordering::SeqCst),
            overflows: self.inner.overflows.load(Ordering::SeqCst),
        }
    }

    /// True once the observer has degraded to latest-only delivery.
    pub fn is_degraded(&self) -> bool {
        self.inner.latest_only.load(Ordering::SeqCst)
    }

    /// Cancel the observer. Synchronous: when this returns, no further
    /// callback will run (an in-flight callback is waited out). Idempotent.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        // Taking the callback waits for any in-flight delivery to finish
        {
            let mut callback = self.inner.callback.lock();
            callback.take();
        }
        self.inner.pending.lock().take();
        // Unblock the delivery task wherever it is waiting
        self.inner.credit.add_permits(1);
        self.inner.wakeup.notify_one();
        self.observers.write().remove(&self.inner.id);
        tracing::info!(id = self.inner.id, "observer cancelled");
    }
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        self.cancel();
        self.task.abort();
    }
}
