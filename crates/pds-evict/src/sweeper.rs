//! Bounded, chunked eviction sweeps.
//!
//! A sweep removes matching documents from local storage only: no merge,
//! no tombstone, no delta. Sweeps run at a bounded frequency (never per
//! mutation) and in `LIMIT`-bounded chunks, each chunk its own atomic
//! unit, so a cancellation mid-sweep leaves storage consistent (some
//! candidates evicted, the rest intact, nothing corrupt).
//!
//! Before any document leaves, active subscriptions whose predicate still
//! matches a candidate are cancelled and recreated with the eviction
//! predicate's complement folded in; without that step the next
//! negotiation round would immediately re-download everything the sweep
//! removed.

use crate::policy::{DocLifecycle, EvictionPolicy};
use parking_lot::Mutex;
use pds_query::ast::{EvictStatement, Expr, Statement};
use pds_query::{Params, QueryError, QueryExecutor, QueryOutcome};
use pds_store::DocumentId;
use pds_sync::{SubscriptionDescriptor, SubscriptionHandle, SubscriptionManager, SyncError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EvictError {
    /// Sweeps are rate-limited; try again after the interval has passed.
    #[error("sweep ran {elapsed_ms}ms ago; minimum interval is {min_ms}ms")]
    SweepTooSoon { elapsed_ms: u64, min_ms: u64 },

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// Sweep tunables.
#[derive(Clone, Debug)]
pub struct EvictionConfig {
    /// Minimum time between sweeps.
    pub min_sweep_interval: Duration,
    /// Documents evicted per chunk.
    pub chunk_limit: usize,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            min_sweep_interval: Duration::from_secs(300),
            chunk_limit: 500,
        }
    }
}

/// Cooperative cancellation for a running sweep. Cancelling between
/// chunks stops the sweep; the chunks already applied stay applied.
#[derive(Clone, Default)]
pub struct SweepCancelToken {
    cancelled: Arc<AtomicBool>,
}

impl SweepCancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Result of one sweep.
#[derive(Clone, Debug, Default)]
pub struct SweepStats {
    pub evicted: usize,
    pub chunks: usize,
    pub cancelled: bool,
    /// Subscriptions cancelled and recreated with refined predicates.
    pub subscriptions_refined: usize,
}

/// Runs eviction sweeps against one store.
pub struct EvictionManager {
    exec: QueryExecutor,
    subscriptions: Arc<SubscriptionManager>,
    config: EvictionConfig,
    last_sweep: Mutex<Option<Instant>>,
    /// Refined subscriptions live here so they outlast the sweep.
    refined: Mutex<Vec<SubscriptionHandle>>,
}

impl EvictionManager {
    pub fn new(
        exec: QueryExecutor,
        subscriptions: Arc<SubscriptionManager>,
        config: EvictionConfig,
    ) -> Self {
        Self {
            exec,
            subscriptions,
            config,
            last_sweep: Mutex::new(None),
            refined: Mutex::new(Vec::new()),
        }
    }

    /// Where a document stands in the policy's lifecycle.
    pub fn classify(
        &self,
        policy: &EvictionPolicy,
        id: &DocumentId,
    ) -> Result<DocLifecycle, EvictError> {
        let Some(doc) = self.exec.store().snapshot(policy.collection(), id) else {
            return Ok(DocLifecycle::Evicted);
        };
        let predicate = policy.predicate(now_ms());
        if pds_query::eval::matches(Some(&predicate), &doc, &Params::new()) {
            Ok(DocLifecycle::EvictionCandidate)
        } else {
            Ok(DocLifecycle::Synced)
        }
    }

    /// Run one sweep under a policy.
    ///
    /// Bounded frequency: a sweep inside the configured interval returns
    /// [`EvictError::SweepTooSoon`] without touching anything.
    pub fn run_sweep(
        &self,
        policy: &EvictionPolicy,
        cancel: &SweepCancelToken,
    ) -> Result<SweepStats, EvictError> {
        {
            let last = self.last_sweep.lock();
            if let Some(at) = *last {
                let elapsed = at.elapsed();
                if elapsed < self.config.min_sweep_interval {
                    return Err(EvictError::SweepTooSoon {
                        elapsed_ms: elapsed.as_millis() as u64,
                        min_ms: self.config.min_sweep_interval.as_millis() as u64,
                    });
                }
            }
        }

        let now = now_ms();
        let predicate = policy.predicate(now);
        let mut stats = SweepStats::default();

        stats.subscriptions_refined = self.refine_subscriptions(policy, &predicate)?;

        loop {
            if cancel.is_cancelled() {
                stats.cancelled = true;
                tracing::info!(
                    collection = policy.collection(),
                    evicted = stats.evicted,
                    "sweep cancelled between chunks"
                );
                break;
            }
            let statement = Statement::Evict(EvictStatement {
                collection: policy.collection().to_string(),
                predicate: Some(predicate.clone()),
                limit: Some(self.config.chunk_limit),
            });
            let result = self.exec.execute_statement(&statement, &Params::new())?;
            let QueryOutcome::Count(evicted) = result.outcome else {
                break;
            };
            if evicted == 0 {
                break;
            }
            stats.evicted += evicted;
            stats.chunks += 1;
            tracing::debug!(
                collection = policy.collection(),
                chunk = stats.chunks,
                evicted,
                "eviction chunk applied"
            );
        }

        *self.last_sweep.lock() = Some(Instant::now());
        tracing::info!(
            collection = policy.collection(),
            evicted = stats.evicted,
            chunks = stats.chunks,
            "sweep complete"
        );
        Ok(stats)
    }

    /// Cancel subscriptions that would re-download what the sweep is
    /// about to remove, and recreate them with `AND NOT P` folded in.
    ///
    /// The check is empirical, not syntactic: a subscription is unsafe iff
    /// some current candidate actually matches it. A subscription that is
    /// already the exact complement of P matches no candidate and is left
    /// alone.
    fn refine_subscriptions(
        &self,
        policy: &EvictionPolicy,
        predicate: &Expr,
    ) -> Result<usize, EvictError> {
        let candidates: Vec<pds_store::Document> = self
            .exec
            .store()
            .scan(policy.collection())
            .into_iter()
            .filter(|doc| pds_query::eval::matches(Some(predicate), doc, &Params::new()))
            .collect();
        if candidates.is_empty() {
            return Ok(0);
        }

        let collection = policy.collection().to_string();
        let cancelled = self.subscriptions.cancel_where(|descriptor| {
            descriptor.collection == collection
                && candidates.iter().any(|doc| descriptor.matches(doc))
        });

        let mut refined = self.refined.lock();
        for descriptor in &cancelled {
            let narrowed = match &descriptor.predicate {
                Some(existing) => Expr::And(
                    Box::new(existing.clone()),
                    Box::new(predicate.negated()),
                ),
                None => predicate.negated(),
            };
            let handle = self.subscriptions.register(SubscriptionDescriptor::new(
                descriptor.collection.clone(),
                Some(narrowed),
                descriptor.params.clone(),
            ))?;
            refined.push(handle);
        }
        Ok(cancelled.len())
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
