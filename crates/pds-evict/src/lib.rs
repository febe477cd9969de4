// File: `crates/pds-evict/src/lib.rs`
pub mod policy;
pub mod sweeper;

pub use policy::{DocLifecycle, EvictionPolicy};
pub use sweeper::{EvictError, EvictionConfig, EvictionManager, SweepCancelToken, SweepStats};
