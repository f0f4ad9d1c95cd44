//! Error types for storage operations.

use crate::types::{BlobId, Oid, Tid, TxnToken};
use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend cannot be reached. Transient.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A record is corrupt or violates a storage invariant.
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// Another live record already uses this name under the same parent or owner.
    #[error("duplicate name {name:?} under {parent}")]
    DuplicateName {
        /// Parent (or annotation owner) id.
        parent: Oid,
        /// Conflicting local name.
        name: String,
    },

    /// A buffered write assumed a serial that is no longer current.
    #[error("tid conflict on {oid}: expected {expected:?}, found {found:?}")]
    TidConflict {
        /// Object whose serial moved.
        oid: Oid,
        /// Serial the write was based on.
        expected: Option<Tid>,
        /// Serial currently committed.
        found: Option<Tid>,
    },

    /// The write buffer was already committed, aborted, or never opened.
    #[error("unknown transaction {0}")]
    UnknownTransaction(TxnToken),

    /// No chunks are stored for the blob.
    #[error("blob not found: {0}")]
    BlobNotFound(BlobId),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Persisted state could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Create an unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    /// Create an integrity error.
    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity(message.into())
    }

    /// Returns true if replaying the whole transaction may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::TidConflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(StorageError::unavailable("down").is_retryable());
        assert!(StorageError::TidConflict {
            oid: Oid::new("a"),
            expected: Some(Tid::new(1)),
            found: Some(Tid::new(2)),
        }
        .is_retryable());
        assert!(!StorageError::integrity("bad").is_retryable());
        assert!(!StorageError::DuplicateName {
            parent: Oid::root(),
            name: "x".into(),
        }
        .is_retryable());
    }
}
