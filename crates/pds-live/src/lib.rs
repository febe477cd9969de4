// File: `crates/pds-live/src/lib.rs`
pub mod cursor;
pub mod pipeline;

pub use cursor::{ResultCursor, ResultSnapshot};
pub use pipeline::{
    CreditGrant, ObserveError, ObserverConfig, ObserverHandle, ObserverPipeline, ObserverStats,
};
