//! Error types for Canopy core.

use crate::object::PersistentObject;
use canopy_storage::{Oid, StorageError, Tid};
use std::fmt;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Two concurrent versions of an object that touched the same field.
#[derive(Debug, Clone)]
pub struct UnresolvableConflict {
    /// The version this transaction tried to write.
    pub ours: PersistentObject,
    /// The committed version it collided with.
    pub theirs: PersistentObject,
    /// The change key both sides touched, if the collision is field-level.
    pub key: Option<String>,
}

impl UnresolvableConflict {
    /// Creates a conflict report.
    #[must_use]
    pub fn new(ours: PersistentObject, theirs: PersistentObject, key: Option<String>) -> Self {
        Self { ours, theirs, key }
    }

    /// The conflicting object's id.
    #[must_use]
    pub fn oid(&self) -> &Oid {
        self.ours.oid()
    }
}

impl fmt::Display for UnresolvableConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (ours {:?}, theirs ", self.ours.oid(), self.ours.serial())?;
        write!(f, "{:?})", self.theirs.serial())?;
        if let Some(key) = &self.key {
            write!(f, " on `{key}`")?;
        }
        Ok(())
    }
}

/// Errors that can occur in Canopy core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// State codec error.
    #[error("codec error: {0}")]
    Codec(#[from] canopy_codec::CodecError),

    /// Objects written by this transaction were committed by another one.
    #[error("conflict with {tid}: {} object(s) modified concurrently", oids.len())]
    Conflict {
        /// Newest committed tid at vote time.
        tid: Tid,
        /// Objects written by both transactions.
        oids: Vec<Oid>,
    },

    /// Both transactions touched the same field.
    #[error("unresolvable conflict: {0}")]
    Unresolvable(Box<UnresolvableConflict>),

    /// The transaction already committed or aborted.
    #[error("transaction is {status}")]
    TransactionClosed {
        /// Terminal status.
        status: crate::TransactionStatus,
    },

    /// Writes are not allowed in a read-only transaction.
    #[error("transaction is read-only")]
    ReadOnly,

    /// Another transaction holds the object lock too long.
    #[error("timed out waiting for lock on {oid}")]
    LockTimeout {
        /// Locked object.
        oid: Oid,
    },

    /// Strategy name not recognised.
    #[error("unknown transaction strategy: {0}")]
    UnknownStrategy(String),

    /// Object does not exist.
    #[error("object not found: {0}")]
    NotFound(Oid),

    /// The call is not valid in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of the misuse.
        message: String,
    },
}

impl CoreError {
    /// Creates an invalid-operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true if replaying the whole unit of work may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_retryable(),
            Self::Conflict { .. } | Self::Unresolvable(_) | Self::LockTimeout { .. } => true,
            _ => false,
        }
    }

    /// Returns true for the backend's serial-verification failure.
    #[must_use]
    pub fn is_tid_conflict(&self) -> bool {
        matches!(self, Self::Storage(StorageError::TidConflict { .. }))
    }

    /// Returns true for any conflict signal raised during vote or commit.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Unresolvable(_)) || self.is_tid_conflict()
    }
}
