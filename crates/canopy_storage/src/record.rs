//! The flat, storage-ready form of a persistent object.

use crate::types::{Oid, Tid};
use bytes::Bytes;
use canopy_codec::Value;
use serde::{Deserialize, Serialize};

/// A stored record.
///
/// A record lives either in the tree (`parent_id` + `local_name`) or as an
/// annotation (`owner_id` + `local_name`). Deleting a record moves it under
/// [`Oid::trashed`], which hides it from tree and annotation lookups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Object identifier.
    pub oid: Oid,
    /// Transaction that wrote this version.
    pub tid: Tid,
    /// Version this write was based on; `None` for a first write.
    pub old_serial: Option<Tid>,
    /// Tree parent, or the trashed sentinel.
    pub parent_id: Option<Oid>,
    /// Annotation owner.
    pub owner_id: Option<Oid>,
    /// Name under the parent or owner.
    pub local_name: Option<String>,
    /// Entity kind used to select the reader, writer and resolver.
    pub type_tag: String,
    /// Name of the codec that produced `state`.
    pub codec: String,
    /// Opaque encoded state.
    pub state: Bytes,
    /// Optional structured data for search; never consulted by the core.
    pub side_index: Option<Value>,
    /// Opaque partition key.
    pub partition: u32,
}

impl Record {
    /// Creates a detached record with empty state.
    pub fn new(oid: Oid, type_tag: impl Into<String>) -> Self {
        Self {
            oid,
            tid: Tid::ZERO,
            old_serial: None,
            parent_id: None,
            owner_id: None,
            local_name: None,
            type_tag: type_tag.into(),
            codec: canopy_codec::CBOR.to_string(),
            state: Bytes::new(),
            side_index: None,
            partition: 0,
        }
    }

    /// Places the record in the tree.
    #[must_use]
    pub fn with_parent(mut self, parent: Oid, name: impl Into<String>) -> Self {
        self.parent_id = Some(parent);
        self.owner_id = None;
        self.local_name = Some(name.into());
        self
    }

    /// Attaches the record as an annotation of `owner`.
    #[must_use]
    pub fn with_owner(mut self, owner: Oid, name: impl Into<String>) -> Self {
        self.owner_id = Some(owner);
        self.parent_id = None;
        self.local_name = Some(name.into());
        self
    }

    /// Sets the encoded state and the codec that produced it.
    #[must_use]
    pub fn with_state(mut self, codec: impl Into<String>, state: impl Into<Bytes>) -> Self {
        self.codec = codec.into();
        self.state = state.into();
        self
    }

    /// Sets the serial this write is based on.
    #[must_use]
    pub fn with_old_serial(mut self, serial: Option<Tid>) -> Self {
        self.old_serial = serial;
        self
    }

    /// Sets the side index.
    #[must_use]
    pub fn with_side_index(mut self, side_index: Option<Value>) -> Self {
        self.side_index = side_index;
        self
    }

    /// Sets the partition key.
    #[must_use]
    pub fn with_partition(mut self, partition: u32) -> Self {
        self.partition = partition;
        self
    }

    /// Returns true if the record has been deleted.
    #[must_use]
    pub fn is_trashed(&self) -> bool {
        self.parent_id.as_ref().is_some_and(Oid::is_trashed)
    }

    /// Returns true if the record is a live annotation.
    #[must_use]
    pub fn is_annotation(&self) -> bool {
        self.owner_id.is_some() && !self.is_trashed()
    }

    /// The `(container, name)` pair this record occupies, if it is live.
    ///
    /// The container is the owner for annotations and the parent otherwise.
    #[must_use]
    pub fn slot(&self) -> Option<(&Oid, &str)> {
        if self.is_trashed() {
            return None;
        }
        let name = self.local_name.as_deref()?;
        match (&self.owner_id, &self.parent_id) {
            (Some(owner), _) => Some((owner, name)),
            (None, Some(parent)) => Some((parent, name)),
            (None, None) => None,
        }
    }

    /// Size of the encoded state in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.state.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_tree_slot() {
        let rec = Record::new(Oid::new("a"), "item").with_parent(Oid::root(), "a");
        let (parent, name) = rec.slot().unwrap();
        assert_eq!(parent, &Oid::root());
        assert_eq!(name, "a");
        assert!(!rec.is_annotation());
    }

    #[test]
    fn record_annotation_slot_uses_owner() {
        let owner = Oid::new("o");
        let rec = Record::new(Oid::new("n"), "annotation").with_owner(owner.clone(), "notes");
        assert!(rec.is_annotation());
        assert_eq!(rec.slot().unwrap().0, &owner);
    }

    #[test]
    fn trashed_record_has_no_slot() {
        let mut rec = Record::new(Oid::new("a"), "item").with_parent(Oid::root(), "a");
        rec.parent_id = Some(Oid::trashed());
        assert!(rec.is_trashed());
        assert!(rec.slot().is_none());
    }

    #[test]
    fn size_is_state_length() {
        let rec = Record::new(Oid::new("a"), "item").with_state("cbor", vec![1u8, 2, 3]);
        assert_eq!(rec.size(), 3);
        assert_eq!(rec.codec, "cbor");
    }
}
