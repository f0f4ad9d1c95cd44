//! # Canopy Core
//!
//! Transactional persistence for a tree of objects.
//!
//! This crate provides:
//! - [`TransactionManager`] and [`Transaction`]: units of work with a
//!   three-step commit (store, vote, finish)
//! - Pluggable concurrency-control strategies ([`StrategyKind`])
//! - Field-level conflict resolution through [`Resolver`]s
//! - Read-through object caching with cross-process invalidation
//! - Per-object locks for the pessimistic strategy
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use canopy_core::{Config, KindRegistry, PersistentObject, TransactionManager};
//! use canopy_storage::{InMemoryBackend, Oid};
//! use std::sync::Arc;
//!
//! let manager = TransactionManager::new(
//!     Arc::new(InMemoryBackend::new()),
//!     Arc::new(KindRegistry::new()),
//!     Config::default(),
//!     None,
//! );
//! manager.initialize().await?;
//!
//! let mut txn = manager.begin().await?;
//! let page = PersistentObject::new("page").with_field("title", "Welcome");
//! txn.add_child(&Oid::root(), "welcome", page).await?;
//! txn.commit().await?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod config;
mod context;
mod error;
mod lock;
mod manager;
mod object;
mod registry;
mod strategy;
mod transaction;

pub use cache::{ChangeKind, TransactionCache, TransactionCacheStats};
pub use config::{Config, StrategyKind};
pub use context::StrategyContext;
pub use error::{CoreError, CoreResult, UnresolvableConflict};
pub use lock::{LockTable, ObjectLock};
pub use manager::{StatsSnapshot, TransactionManager, TransactionStats, TxnFuture};
pub use object::{Location, PersistentObject, LOCATION_KEY};
pub use registry::{
    AnnotationResolver, FieldReader, FieldResolver, FieldWriter, KindRegistry, NeverMerge, Reader,
    Resolver, Writer, ANNOTATION_KIND, GENERIC_KIND, ROOT_KIND,
};
pub use strategy::{
    strategy_for, BeginMode, LockStrategy, NoneStrategy, ResolveStrategy, SerializableStrategy,
    SimpleStrategy, TidOnlyStrategy, TransactionStrategy, VoteOutcome,
};
pub use transaction::{Transaction, TransactionStatus, CHILD_BATCH_SIZE};

pub use canopy_codec::Value;
pub use canopy_storage::{Oid, Tid};
