//! Error types for the store layer.

use crate::document::DocumentId;
use thiserror::Error;

/// Errors that can occur applying mutations to the store.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("document not found: {0}")]
    DocumentNotFound(DocumentId),

    #[error("document {id} would grow to {size} bytes, over the {limit} byte ceiling")]
    SizeLimitExceeded {
        id: DocumentId,
        size: usize,
        limit: usize,
    },
}

pub type Result<T> = std::result::Result<T, StoreError>;
