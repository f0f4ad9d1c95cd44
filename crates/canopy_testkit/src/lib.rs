//! # Canopy Testkit
//!
//! Test utilities for Canopy.
//!
//! This crate provides:
//! - Managers over in-memory and file-backed storage
//! - Multi-process cache clusters sharing one storage, shared tier and
//!   pub/sub channel
//! - Property-based test generators using proptest
//! - Concurrency stress helpers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use canopy_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn commits_a_child() {
//!     let db = TestManager::memory(StrategyKind::Resolve).await;
//!     let oid = seed_child(&db, "page", &[("title", "a".into())]).await;
//!     assert!(db.begin().await.unwrap().get(&oid).await.unwrap().is_some());
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
    pub use canopy_core::{Config, PersistentObject, StrategyKind, TransactionManager};
    pub use canopy_storage::Oid;
}

pub use fixtures::*;
pub use generators::*;
pub use stress::*;
