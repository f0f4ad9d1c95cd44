//! Error types for cache operations.

use canopy_codec::CodecError;
use thiserror::Error;

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors raised by cache tiers and the pub/sub channel.
///
/// The cache never fails a transaction: [`CacheUtility`](crate::CacheUtility)
/// logs these and carries on without the failing tier.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The shared tier or pub/sub service cannot be reached.
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    /// A cached value or message could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl CacheError {
    /// Create an unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    /// Returns true if the operation may succeed when retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
