// File: `crates/pds-sync/src/lib.rs`
pub mod channel;
pub mod error;
pub mod message;
pub mod replicator;
pub mod subscription;

pub use channel::{LoopbackChannel, PeerChannel, PeerId};
pub use error::SyncError;
pub use message::{DeltaMessage, DocumentHead, MergeReport, SyncMessage};
pub use replicator::{ReplicationManager, SyncConfig, SyncConfigBuilder, SyncEvent};
pub use subscription::{
    SubscriptionDescriptor, SubscriptionHandle, SubscriptionManager, SubscriptionState,
};
