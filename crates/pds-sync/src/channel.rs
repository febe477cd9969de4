//! The byte-oriented peer channel boundary.
//!
//! Transport and discovery live outside the core: whatever mesh the host
//! forms, it hands each peer link to us as something that can carry bytes.
//! The loopback implementation wires two in-process endpoints together for
//! tests and simulation.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Unique identifier for a peer link.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Channel error type.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("peer not found: {0}")]
    PeerNotFound(PeerId),
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Abstract byte channel to connected peers.
#[async_trait]
pub trait PeerChannel: Send + Sync + 'static {
    /// Send a frame to a specific peer.
    async fn send(&self, peer: &PeerId, frame: Vec<u8>) -> Result<(), ChannelError>;

    /// Peers currently reachable over this channel.
    fn connected_peers(&self) -> Vec<PeerId>;

    /// Take the incoming-frame receiver. Can only be taken once.
    fn subscribe(&self) -> mpsc::Receiver<(PeerId, Vec<u8>)>;
}

type SharedReceiver = Arc<RwLock<Option<mpsc::Receiver<(PeerId, Vec<u8>)>>>>;
type SharedOutgoing = Arc<RwLock<HashMap<PeerId, mpsc::Sender<(PeerId, Vec<u8>)>>>>;

/// In-memory channel for tests and simulation.
pub struct LoopbackChannel {
    local_id: PeerId,
    incoming_tx: mpsc::Sender<(PeerId, Vec<u8>)>,
    incoming_rx: SharedReceiver,
    outgoing: SharedOutgoing,
}

impl LoopbackChannel {
    pub fn new(local_id: PeerId) -> Self {
        let (tx, rx) = mpsc::channel(256);
        Self {
            local_id,
            incoming_tx: tx,
            incoming_rx: Arc::new(RwLock::new(Some(rx))),
            outgoing: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Wire two endpoints together bidirectionally.
    pub fn connect_to(&self, other: &LoopbackChannel) {
        self.outgoing
            .write()
            .insert(other.local_id.clone(), other.incoming_tx.clone());
        other
            .outgoing
            .write()
            .insert(self.local_id.clone(), self.incoming_tx.clone());
    }

    /// Drop the link in both directions.
    pub fn disconnect_from(&self, other: &LoopbackChannel) {
        self.outgoing.write().remove(&other.local_id);
        other.outgoing.write().remove(&self.local_id);
    }
}

#[async_trait]
impl PeerChannel for LoopbackChannel {
    async fn send(&self, peer: &PeerId, frame: Vec<u8>) -> Result<(), ChannelError> {
        let tx = {
            let outgoing = self.outgoing.read();
            outgoing.get(peer).cloned()
        };
        match tx {
            Some(tx) => tx
                .send((self.local_id.clone(), frame))
                .await
                .map_err(|e| ChannelError::SendFailed(e.to_string())),
            None => Err(ChannelError::PeerNotFound(peer.clone())),
        }
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.outgoing.read().keys().cloned().collect();
        peers.sort();
        peers
    }

    fn subscribe(&self) -> mpsc::Receiver<(PeerId, Vec<u8>)> {
        self.incoming_rx
            .write()
            .take()
            .expect("subscribe can only be called once")
    }
}

/// Create a fully-connected mesh of loopback channels for tests.
pub fn create_mesh(count: usize) -> Vec<LoopbackChannel> {
    let channels: Vec<_> = (0..count)
        .map(|i| LoopbackChannel::new(PeerId::new(format!("peer-{i}"))))
        .collect();
    for i in 0..count {
        for j in (i + 1)..count {
            channels[i].connect_to(&channels[j]);
        }
    }
    channels
}
