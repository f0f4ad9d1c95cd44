//! # Canopy Cache
//!
//! Two-tier object cache with pub/sub invalidation.
//!
//! ## Tiers
//!
//! - [`EvictionCache`]: per-process, bounded by total entry size, evicts
//!   least recently used entries
//! - [`SharedCache`]: optional network cache shared by every process
//!
//! After a commit, the committing process deletes stale keys from both
//! tiers, writes fresh values for up to `max_publish_objects` objects, and
//! publishes an [`InvalidationMessage`] so peers drop (or replace) their
//! in-process copies. The publisher ignores its own echo once.
//!
//! Cache failures are logged and never surface to callers.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod lru;
mod message;
mod pubsub;
mod shared;
mod utility;
mod value;

pub use config::CacheConfig;
pub use error::{CacheError, CacheResult};
pub use lru::{CacheStats, EvictionCache};
pub use message::InvalidationMessage;
pub use pubsub::{MemoryPubSub, PubSub, Subscriber};
pub use shared::{MemorySharedCache, SharedCache};
pub use utility::{CacheUtility, CacheUtilityStats, MAX_IGNORED_TIDS};
pub use value::{CacheValue, CachedRecord};
