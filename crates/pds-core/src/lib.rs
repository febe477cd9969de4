// File: `crates/pds-core/src/lib.rs`
pub mod clock;
pub mod counter;
pub mod map;
pub mod merge;
pub mod path;
pub mod register;
pub mod scalar;
pub mod value;

pub use clock::{FieldClock, VersionVector, WriterId};
pub use counter::PnCounter;
pub use map::CrdtMap;
pub use merge::Merge;
pub use path::FieldPath;
pub use register::Register;
pub use scalar::{AttachmentToken, Scalar};
pub use value::CrdtValue;
