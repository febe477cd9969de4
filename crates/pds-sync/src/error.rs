//! Error types for the replication layer.

use crate::channel::PeerId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// The subscription predicate filters on the tombstone field. A peer
    /// that never stores a tombstone cannot relay it to a third peer, so
    /// such predicates are rejected outright.
    #[error(
        "subscription predicate references the tombstone field; \
         filter deleted documents in observers or ad-hoc queries instead"
    )]
    TombstoneExcluded,

    #[error("subscription statement must be a SELECT")]
    NotASelect,

    #[error("unknown peer {0}")]
    PeerUnknown(PeerId),

    #[error("peer {0} is disconnected")]
    PeerDisconnected(PeerId),

    #[error("malformed sync message: {0}")]
    Decode(String),

    #[error("negotiation with {peer} failed: {reason}")]
    NegotiationFailed { peer: PeerId, reason: String },

    #[error(transparent)]
    Query(#[from] pds_query::QueryError),
}

pub type Result<T> = std::result::Result<T, SyncError>;
