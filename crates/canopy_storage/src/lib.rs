//! # Canopy Storage
//!
//! Record model and storage backend SPI for Canopy.
//!
//! This crate is the lowest layer of the repository. It knows about object
//! ids, transaction ids and the flat [`Record`] form of an object, but not
//! about how object state is encoded or how conflicts are resolved.
//!
//! ## Design Principles
//!
//! - Record state is opaque bytes; the codec name travels with it
//! - Writes are buffered per backend transaction and made visible atomically
//! - Tids are strictly increasing and never reused
//! - Backends are `Send + Sync` and every call is atomic
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and ephemeral repositories
//! - [`FileBackend`] - Snapshot-persisted repository on the local disk

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;
mod record;
mod types;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
pub use record::Record;
pub use types::{BlobId, Oid, Tid, TxnToken};
