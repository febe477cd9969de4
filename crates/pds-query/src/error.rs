//! Error types for the query layer.

use pds_store::{DocumentId, StoreError};
use thiserror::Error;

/// Errors surfaced to the caller of a query or mutation.
#[derive(Error, Debug, Clone)]
pub enum QueryError {
    /// Malformed statement text. Fatal to this call only.
    #[error("parse error at line {line}, column {column}: {message}")]
    Parse {
        line: u32,
        column: u32,
        message: String,
    },

    /// A statement referenced a parameter that was not bound.
    #[error("unbound parameter {0}")]
    UnboundParam(String),

    /// `ON ID CONFLICT DO FAIL` (the default) hit an existing id.
    #[error("insert conflict on existing id {0}")]
    ConflictPolicy(DocumentId),

    /// A composite key component used a non-key-safe scalar.
    #[error("invalid key component {field}: {reason}")]
    InvalidKey { field: String, reason: String },

    /// Storage-layer failure while applying a mutation. Never swallowed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, QueryError>;
