// File: `crates/pds-store/src/lib.rs`
pub mod delta;
pub mod document;
pub mod error;
pub mod store;

pub use delta::{DocumentDelta, MergeOutcome};
pub use document::{Document, DocumentId, KeyScalar, TOMBSTONE_FIELD};
pub use error::StoreError;
pub use store::{ChangeKind, ChangeNotice, DocumentStore, LoggedDelta, StoreConfig, StoreStats};
