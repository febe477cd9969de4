//! Replication manager.
//!
//! Owns the per-peer replication state table: what each connected peer
//! subscribes to, which version vector it advertised, and which log prefix
//! it has acknowledged. Negotiation currency is the version vector -
//! once both sides know what the other has, only the missing per-field
//! deltas travel, never whole documents.
//!
//! Storage rule: an incoming delta is stored only if, after applying it,
//! the document matches one of OUR subscriptions (evaluated against the
//! full document, tombstones included). Outgoing deltas are filtered the
//! same way against the REMOTE peer's subscription set, which is what
//! makes multi-hop relay work: whatever we store, we can relay.

use crate::channel::{PeerChannel, PeerId};
use crate::error::SyncError;
use crate::message::{DeltaMessage, DocumentHead, MergeReport, SyncMessage};
use crate::subscription::{SubscriptionDescriptor, SubscriptionManager};
use parking_lot::{Mutex, RwLock};
use pds_core::clock::{VersionVector, WriterId};
use pds_store::{Document, DocumentId, DocumentStore};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Tunables for delta exchange and retry behavior.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Base delay for negotiation retry backoff (milliseconds).
    pub retry_base_ms: u64,
    /// Ceiling for the backoff delay (milliseconds).
    pub retry_max_ms: u64,
    /// Attempts before a negotiation round is reported failed.
    pub max_retries: u32,
    /// Maximum deltas per DeltaSet frame.
    pub max_batch: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry_base_ms: 100,
            retry_max_ms: 5_000,
            max_retries: 5,
            max_batch: 256,
        }
    }
}

/// Builder for [`SyncConfig`].
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    pub fn retry_base(mut self, ms: u64) -> Self {
        self.config.retry_base_ms = ms;
        self
    }

    pub fn retry_max(mut self, ms: u64) -> Self {
        self.config.retry_max_ms = ms;
        self
    }

    pub fn max_retries(mut self, attempts: u32) -> Self {
        self.config.max_retries = attempts;
        self
    }

    pub fn max_batch(mut self, size: usize) -> Self {
        self.config.max_batch = size;
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}

impl Default for SyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Asynchronous replication happenings, observable for monitoring only.
#[derive(Clone, Debug)]
pub enum SyncEvent {
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    DeltasSent { peer: PeerId, count: usize },
    DeltasApplied { peer: PeerId, applied: usize, failed: usize },
    NegotiationRetry { peer: PeerId, attempt: u32 },
}

/// Per-peer replication state. Survives disconnection; discarded only
/// when the link is torn down for good.
#[derive(Debug, Default)]
struct PeerState {
    connected: bool,
    remote_writer: Option<WriterId>,
    /// Per-document versions the peer advertised in its last handshake.
    remote_heads: HashMap<(String, DocumentId), VersionVector>,
    /// What the peer wants.
    remote_subscriptions: Vec<SubscriptionDescriptor>,
    /// Our log prefix the peer has confirmed applying.
    acked_seq: u64,
}

/// The replication manager for one local node.
pub struct ReplicationManager {
    store: Arc<DocumentStore>,
    subscriptions: Arc<SubscriptionManager>,
    config: SyncConfig,
    peers: RwLock<HashMap<PeerId, PeerState>>,
    event_senders: Mutex<Vec<mpsc::UnboundedSender<SyncEvent>>>,
}

impl ReplicationManager {
    pub fn new(
        store: Arc<DocumentStore>,
        subscriptions: Arc<SubscriptionManager>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            subscriptions,
            config,
            peers: RwLock::new(HashMap::new()),
            event_senders: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    /// Monitoring hook: replication and backpressure failures surface
    /// here, never through the mutation path.
    pub fn subscribe_events(&self) -> mpsc::UnboundedReceiver<SyncEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.event_senders.lock().push(tx);
        rx
    }

    fn emit(&self, event: SyncEvent) {
        let mut senders = self.event_senders.lock();
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Establish (or resume) a peer link. Reconnection keeps the acked
    /// state so delta exchange resumes from the last acknowledged clock.
    pub fn peer_connected(&self, peer: PeerId) {
        let mut peers = self.peers.write();
        let state = peers.entry(peer.clone()).or_default();
        state.connected = true;
        drop(peers);
        tracing::info!(%peer, "peer link up");
        self.emit(SyncEvent::PeerConnected(peer));
    }

    /// Suspend delta exchange without discarding subscription or ack state.
    pub fn peer_disconnected(&self, peer: &PeerId) {
        let mut peers = self.peers.write();
        if let Some(state) = peers.get_mut(peer) {
            state.connected = false;
        }
        drop(peers);
        tracing::info!(%peer, "peer link suspended");
        self.emit(SyncEvent::PeerDisconnected(peer.clone()));
    }

    /// Drop a peer's state entirely (link teardown).
    pub fn peer_forgotten(&self, peer: &PeerId) {
        self.peers.write().remove(peer);
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self
            .peers
            .read()
            .iter()
            .filter(|(_, s)| s.connected)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Handshake frame for a freshly (re)connected link.
    pub fn hello_frame(&self) -> Result<Vec<u8>, SyncError> {
        let heads = self
            .store
            .document_heads()
            .into_iter()
            .map(|(collection, id, vv)| DocumentHead { collection, id, vv })
            .collect();
        SyncMessage::Hello {
            writer: self.store.writer().clone(),
            heads,
            subscriptions: self.subscriptions.descriptors(),
        }
        .encode()
    }

    /// Ingest one frame from a peer. Returns the response frames to send
    /// back over the same link.
    pub fn ingest(&self, peer: &PeerId, frame: &[u8]) -> Result<Vec<Vec<u8>>, SyncError> {
        let message = SyncMessage::decode(frame)?;
        match message {
            SyncMessage::Hello {
                writer,
                heads,
                subscriptions,
            } => {
                {
                    let mut peers = self.peers.write();
                    let state = peers
                        .get_mut(peer)
                        .ok_or_else(|| SyncError::PeerUnknown(peer.clone()))?;
                    state.remote_writer = Some(writer);
                    state.remote_heads = heads
                        .into_iter()
                        .map(|head| ((head.collection, head.id), head.vv))
                        .collect();
                    state.remote_subscriptions = subscriptions;
                }
                self.subscriptions.activate_pending();
                // Answer immediately with whatever the peer is missing
                let deltas = self.produce_deltas(peer, None)?;
                if deltas.is_empty() {
                    Ok(Vec::new())
                } else {
                    self.emit(SyncEvent::DeltasSent {
                        peer: peer.clone(),
                        count: deltas.len(),
                    });
                    Ok(vec![SyncMessage::DeltaSet { deltas }.encode()?])
                }
            }

            SyncMessage::Subscribe { subscriptions } => {
                let mut peers = self.peers.write();
                let state = peers
                    .get_mut(peer)
                    .ok_or_else(|| SyncError::PeerUnknown(peer.clone()))?;
                state.remote_subscriptions = subscriptions;
                Ok(Vec::new())
            }

            SyncMessage::DeltaSet { deltas } => {
                let report = self.apply_delta_set(peer, &deltas)?;
                let ack_seq = deltas.iter().map(|d| d.seq).max().unwrap_or(0);
                self.emit(SyncEvent::DeltasApplied {
                    peer: peer.clone(),
                    applied: report.applied,
                    failed: report.failed.len(),
                });
                let ack = SyncMessage::Ack { seq: ack_seq }.encode()?;
                Ok(vec![ack])
            }

            SyncMessage::Ack { seq } => {
                let mut peers = self.peers.write();
                let state = peers
                    .get_mut(peer)
                    .ok_or_else(|| SyncError::PeerUnknown(peer.clone()))?;
                state.acked_seq = state.acked_seq.max(seq);
                Ok(Vec::new())
            }
        }
    }

    /// Apply a batch of remote deltas. Each delta is independent: one bad
    /// delta is reported and skipped, never aborting its siblings.
    pub fn apply_delta_set(
        &self,
        peer: &PeerId,
        deltas: &[DeltaMessage],
    ) -> Result<MergeReport, SyncError> {
        {
            let peers = self.peers.read();
            let state = peers
                .get(peer)
                .ok_or_else(|| SyncError::PeerUnknown(peer.clone()))?;
            if !state.connected {
                return Err(SyncError::PeerDisconnected(peer.clone()));
            }
        }

        let mut report = MergeReport::default();
        for message in deltas {
            let delta = &message.delta;
            // Store only what our own subscriptions declare we keep.
            if !self.locally_wanted(delta) {
                report.unchanged += 1;
                continue;
            }
            match self.store.apply(delta) {
                Ok(pds_store::MergeOutcome::Unchanged) => report.unchanged += 1,
                Ok(_) => report.applied += 1,
                Err(err) => {
                    tracing::warn!(id = %delta.id, error = %err, "remote delta rejected");
                    report.failed.push((delta.id.clone(), err.to_string()));
                }
            }
        }
        Ok(report)
    }

    /// Would this delta's document (after application) match one of our
    /// subscriptions? Evaluated on a scratch copy; the store is untouched.
    fn locally_wanted(&self, delta: &pds_store::DocumentDelta) -> bool {
        let mut candidate = self
            .store
            .snapshot(&delta.collection, &delta.id)
            .unwrap_or_else(|| {
                Document::new(delta.collection.clone(), delta.id.clone(), delta.max_clock())
            });
        for (path, value) in &delta.fields {
            candidate.fields.merge_at(path, value.clone());
        }
        self.subscriptions.wants(&candidate)
    }

    /// Deltas the peer is missing: everything in our log past their ack
    /// that their subscription set wants and their advertised per-document
    /// version does not already cover. `since` overrides the advertised
    /// versions with one vector applied to every document.
    pub fn produce_deltas(
        &self,
        peer: &PeerId,
        since: Option<&VersionVector>,
    ) -> Result<Vec<DeltaMessage>, SyncError> {
        let (remote_heads, acked_seq, remote_subscriptions, connected) = {
            let peers = self.peers.read();
            let state = peers
                .get(peer)
                .ok_or_else(|| SyncError::PeerUnknown(peer.clone()))?;
            (
                state.remote_heads.clone(),
                state.acked_seq,
                state.remote_subscriptions.clone(),
                state.connected,
            )
        };
        if !connected {
            return Err(SyncError::PeerDisconnected(peer.clone()));
        }

        let mut out = Vec::new();
        for entry in self.store.log_since(acked_seq) {
            if out.len() >= self.config.max_batch {
                break;
            }
            let delta = &entry.delta;
            // Skip what the peer already has for THIS document
            let covered = since.or_else(|| {
                remote_heads.get(&(delta.collection.clone(), delta.id.clone()))
            });
            if let Some(covered) = covered {
                let all_covered = delta
                    .fields
                    .iter()
                    .all(|(_, value)| covered.contains(&value.type_clock()));
                if all_covered {
                    continue;
                }
            }
            // Relay filter: evaluated against the full current document,
            // tombstoned documents included
            let Some(doc) = self.store.snapshot(&delta.collection, &delta.id) else {
                // Evicted locally since the log entry was written
                continue;
            };
            let wanted = remote_subscriptions
                .iter()
                .any(|descriptor| descriptor.matches(&doc));
            if wanted {
                out.push(DeltaMessage {
                    seq: entry.seq,
                    delta: delta.clone(),
                });
            }
        }
        tracing::debug!(%peer, count = out.len(), "produced deltas");
        Ok(out)
    }

    /// Encoded DeltaSet for a peer, or `None` when it is up to date.
    pub fn produce_frame_for(&self, peer: &PeerId) -> Result<Option<Vec<u8>>, SyncError> {
        let deltas = self.produce_deltas(peer, None)?;
        if deltas.is_empty() {
            return Ok(None);
        }
        self.emit(SyncEvent::DeltasSent {
            peer: peer.clone(),
            count: deltas.len(),
        });
        Ok(Some(SyncMessage::DeltaSet { deltas }.encode()?))
    }

    /// Backoff delay for a retry attempt: exponential with jitter, capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.retry_base_ms;
        let exp = base.saturating_mul(1u64 << attempt.min(16));
        let capped = exp.min(self.config.retry_max_ms);
        let jitter = rand::thread_rng().gen_range(0..=base.max(1) / 2);
        Duration::from_millis(capped + jitter)
    }

    /// Send our handshake over the channel, retrying transient failures
    /// with jittered exponential backoff. A final failure is reported but
    /// tears down nothing: subscription state is untouched.
    pub async fn negotiate<C: PeerChannel>(
        &self,
        peer: &PeerId,
        channel: &C,
    ) -> Result<(), SyncError> {
        let frame = self.hello_frame()?;
        let mut attempt = 0u32;
        loop {
            match channel.send(peer, frame.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.config.max_retries {
                        return Err(SyncError::NegotiationFailed {
                            peer: peer.clone(),
                            reason: err.to_string(),
                        });
                    }
                    tracing::warn!(%peer, attempt, error = %err, "negotiation retry");
                    self.emit(SyncEvent::NegotiationRetry {
                        peer: peer.clone(),
                        attempt,
                    });
                    tokio::time::sleep(self.backoff_delay(attempt)).await;
                }
            }
        }
    }
}

impl std::fmt::Debug for ReplicationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationManager")
            .field("writer", self.store.writer())
            .field("peers", &self.peers.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pds_query::Params;
    use pds_store::StoreConfig;

    fn node(writer: &str) -> (Arc<DocumentStore>, Arc<SubscriptionManager>, ReplicationManager) {
        let store = Arc::new(DocumentStore::new(
            WriterId::new(writer),
            StoreConfig::default(),
        ));
        let subs = Arc::new(SubscriptionManager::new());
        let manager = ReplicationManager::new(store.clone(), subs.clone(), SyncConfig::default());
        (store, subs, manager)
    }

    #[test]
    fn test_unknown_peer_rejected() {
        let (_, _, manager) = node("a");
        let err = manager
            .produce_deltas(&PeerId::new("ghost"), None)
            .unwrap_err();
        assert!(matches!(err, SyncError::PeerUnknown(_)));
    }

    #[test]
    fn test_disconnect_suspends_without_discarding() {
        let (_, _, manager) = node("a");
        let peer = PeerId::new("b");
        manager.peer_connected(peer.clone());

        // Simulate an ack, then a disconnect
        let ack = SyncMessage::Ack { seq: 3 }.encode().unwrap();
        manager.ingest(&peer, &ack).unwrap();
        manager.peer_disconnected(&peer);

        assert!(matches!(
            manager.produce_deltas(&peer, None),
            Err(SyncError::PeerDisconnected(_))
        ));

        // Reconnection resumes from the acked state
        manager.peer_connected(peer.clone());
        let peers = manager.peers.read();
        assert_eq!(peers.get(&peer).unwrap().acked_seq, 3);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let (_, _, manager) = node("a");
        let d1 = manager.backoff_delay(0);
        let d8 = manager.backoff_delay(8);
        assert!(d8 >= d1);
        assert!(d8.as_millis() as u64 <= manager.config.retry_max_ms + manager.config.retry_base_ms);
    }

    #[tokio::test]
    async fn test_negotiation_retries_then_fails() {
        use crate::channel::LoopbackChannel;
        let (_, _, manager) = node("a");
        // Channel with no link to "b": every send fails
        let channel = LoopbackChannel::new(PeerId::new("a"));
        let peer = PeerId::new("b");

        let mut events = manager.subscribe_events();
        let err = manager.negotiate(&peer, &channel).await.unwrap_err();
        assert!(matches!(err, SyncError::NegotiationFailed { .. }));

        // Retries were observable through the monitoring hook
        let mut retries = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SyncEvent::NegotiationRetry { .. }) {
                retries += 1;
            }
        }
        assert!(retries >= 1);
    }

    #[test]
    fn test_subscribers_gate_outgoing() {
        let (store, _, manager_a) = node("a");
        let exec = pds_query::QueryExecutor::new(store.clone());
        exec.execute(
            "INSERT INTO orders DOCUMENTS {_id: 'eu1', region: 'eu'}, {_id: 'us1', region: 'us'}",
            &Params::new(),
        )
        .unwrap();

        let peer = PeerId::new("b");
        manager_a.peer_connected(peer.clone());
        // Peer b announces it only wants the EU slice
        let descriptor =
            SubscriptionDescriptor::from_select("SELECT * FROM orders WHERE region = 'eu'", Params::new())
                .unwrap();
        let hello = SyncMessage::Hello {
            writer: WriterId::new("b"),
            heads: Vec::new(),
            subscriptions: vec![descriptor],
        }
        .encode()
        .unwrap();
        manager_a.ingest(&peer, &hello).unwrap();

        let deltas = manager_a.produce_deltas(&peer, None).unwrap();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].delta.id, pds_store::DocumentId::text("eu1"));
    }
}
