//! Wire messages and framing.
//!
//! Frames are serde_json-encoded [`SyncMessage`] values. JSON keeps the
//! frames inspectable in tests and logs; the channel layer is free to
//! compress underneath.

use crate::error::SyncError;
use crate::subscription::SubscriptionDescriptor;
use pds_core::clock::{VersionVector, WriterId};
use pds_store::{DocumentDelta, DocumentId};
use serde::{Deserialize, Serialize};

/// One replicated delta, tagged with the sender's log sequence so the
/// receiver can acknowledge a contiguous prefix.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeltaMessage {
    pub seq: u64,
    pub delta: DocumentDelta,
}

/// Per-document version summary advertised during handshake. Negotiation
/// is per document: a store-wide vector would falsely cover writes the
/// peer never stored when its subscriptions replicate only a slice.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DocumentHead {
    pub collection: String,
    pub id: DocumentId,
    pub vv: VersionVector,
}

/// Messages exchanged between replication managers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Link handshake: who we are, what we have, what we want.
    Hello {
        writer: WriterId,
        heads: Vec<DocumentHead>,
        subscriptions: Vec<SubscriptionDescriptor>,
    },
    /// Updated subscription set (sent when subscriptions change).
    Subscribe {
        subscriptions: Vec<SubscriptionDescriptor>,
    },
    /// A batch of per-field deltas the receiver is missing.
    DeltaSet { deltas: Vec<DeltaMessage> },
    /// The sender's log prefix up to `seq` has been processed.
    Ack { seq: u64 },
}

impl SyncMessage {
    /// Encode for the byte channel.
    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        serde_json::to_vec(self).map_err(|e| SyncError::Decode(e.to_string()))
    }

    /// Decode a received frame.
    pub fn decode(frame: &[u8]) -> Result<Self, SyncError> {
        serde_json::from_slice(frame).map_err(|e| SyncError::Decode(e.to_string()))
    }
}

/// Result of ingesting a delta batch. One bad delta never aborts the
/// rest of the batch.
#[derive(Clone, Debug, Default)]
pub struct MergeReport {
    pub applied: usize,
    pub unchanged: usize,
    /// Per-document failures, surfaced to monitoring.
    pub failed: Vec<(DocumentId, String)>,
}

impl MergeReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let message = SyncMessage::Hello {
            writer: WriterId::new("a"),
            heads: vec![DocumentHead {
                collection: "orders".into(),
                id: DocumentId::text("o1"),
                vv: VersionVector::from_entries([(WriterId::new("a"), 4)]),
            }],
            subscriptions: Vec::new(),
        };
        let bytes = message.encode().unwrap();
        let decoded = SyncMessage::decode(&bytes).unwrap();
        match decoded {
            SyncMessage::Hello { writer, heads, .. } => {
                assert_eq!(writer, WriterId::new("a"));
                assert_eq!(heads.len(), 1);
                assert_eq!(heads[0].vv.get(&WriterId::new("a")), 4);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(SyncMessage::decode(b"not json").is_err());
    }
}
