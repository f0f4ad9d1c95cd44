//! Identifier types shared by every layer.

use serde::{Deserialize, Serialize};
use std::fmt;

const ROOT_OID: &str = "00000000000000000000000000000000";
const TRASHED_OID: &str = "DDDDDDDDDDDDDDDDDDDDDDDDDDDDDDDD";

/// Opaque object identifier.
///
/// Assigned once when an object is created and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Oid(String);

impl Oid {
    /// Wraps an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// The repository root.
    #[must_use]
    pub fn root() -> Self {
        Self(ROOT_OID.to_string())
    }

    /// Parent of every deleted record.
    #[must_use]
    pub fn trashed() -> Self {
        Self(TRASHED_OID.to_string())
    }

    /// Returns true for the root sentinel.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0 == ROOT_OID
    }

    /// Returns true for the trashed sentinel.
    #[must_use]
    pub fn is_trashed(&self) -> bool {
        self.0 == TRASHED_OID
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Oid {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Transaction identifier.
///
/// Allocated by the backend, strictly increasing and never reused. A
/// record's `tid` doubles as its serial number.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Tid(pub u64);

impl Tid {
    /// Nothing committed yet.
    pub const ZERO: Tid = Tid(0);

    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the following ID.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid:{}", self.0)
    }
}

/// Identifier of a chunked binary object, independent of any oid.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlobId(String);

impl BlobId {
    /// Wraps an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blob:{}", self.0)
    }
}

/// Handle of a backend-level write buffer opened by `start_transaction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxnToken(pub u64);

impl fmt::Display for TxnToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}
