//! Persistent objects and their change sets.
//!
//! A [`PersistentObject`] is a bag of named [`Value`] fields with an
//! identity, a serial and a location. The first time a field changes inside
//! a transaction its original value is recorded; later changes of the same
//! field never overwrite that record. The resolver relies on this to tell a
//! field the other transaction touched from one it did not.

use canopy_codec::{required_text, CodecError, CodecResult, Value};
use canopy_storage::{Oid, Record, Tid};
use std::collections::BTreeMap;

/// Change key under which location moves are recorded.
pub const LOCATION_KEY: &str = "@location";

/// Where an object lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Location {
    /// Not attached anywhere (the root, or an object not yet placed).
    #[default]
    Detached,
    /// A named child of `parent`.
    Tree {
        /// Parent object.
        parent: Oid,
        /// Name under the parent.
        name: String,
    },
    /// A named annotation of `owner`.
    Annotation {
        /// Owning object.
        owner: Oid,
        /// Annotation key.
        name: String,
    },
}

impl Location {
    /// Creates a tree location.
    pub fn child(parent: Oid, name: impl Into<String>) -> Self {
        Location::Tree {
            parent,
            name: name.into(),
        }
    }

    /// Creates an annotation location.
    pub fn annotation(owner: Oid, name: impl Into<String>) -> Self {
        Location::Annotation {
            owner,
            name: name.into(),
        }
    }

    /// Reads the location stored in a record.
    #[must_use]
    pub fn from_record(record: &Record) -> Self {
        let Some(name) = record.local_name.clone() else {
            return Location::Detached;
        };
        if record.is_trashed() {
            return Location::Tree {
                parent: Oid::trashed(),
                name,
            };
        }
        match (&record.owner_id, &record.parent_id) {
            (Some(owner), _) => Location::Annotation {
                owner: owner.clone(),
                name,
            },
            (None, Some(parent)) => Location::Tree {
                parent: parent.clone(),
                name,
            },
            (None, None) => Location::Detached,
        }
    }

    /// Local name, if placed.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self {
            Location::Detached => None,
            Location::Tree { name, .. } | Location::Annotation { name, .. } => Some(name),
        }
    }

    /// Tree parent, if any.
    #[must_use]
    pub fn parent(&self) -> Option<&Oid> {
        match self {
            Location::Tree { parent, .. } => Some(parent),
            _ => None,
        }
    }

    /// Annotation owner, if any.
    #[must_use]
    pub fn owner(&self) -> Option<&Oid> {
        match self {
            Location::Annotation { owner, .. } => Some(owner),
            _ => None,
        }
    }

    /// Returns true if this is the trashed sentinel's subtree.
    #[must_use]
    pub fn is_trashed(&self) -> bool {
        self.parent().is_some_and(Oid::is_trashed)
    }

    /// Encodes the location as a comparable value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Location::Detached => Value::map([("kind", Value::from("detached"))]),
            Location::Tree { parent, name } => Value::map([
                ("kind", Value::from("tree")),
                ("container", Value::from(parent.as_str())),
                ("name", Value::from(name.as_str())),
            ]),
            Location::Annotation { owner, name } => Value::map([
                ("kind", Value::from("annotation")),
                ("container", Value::from(owner.as_str())),
                ("name", Value::from(name.as_str())),
            ]),
        }
    }

    /// Decodes a value produced by [`Location::to_value`].
    pub fn from_value(value: &Value) -> CodecResult<Self> {
        let map = value
            .as_map()
            .ok_or_else(|| CodecError::invalid_structure("location is not a map"))?;
        let kind = required_text(map, "kind")?;
        if kind == "detached" {
            return Ok(Location::Detached);
        }
        let container = Oid::new(required_text(map, "container")?);
        let name = required_text(map, "name")?.to_string();
        match kind {
            "tree" => Ok(Location::Tree {
                parent: container,
                name,
            }),
            "annotation" => Ok(Location::Annotation {
                owner: container,
                name,
            }),
            other => Err(CodecError::invalid_structure(format!(
                "unknown location kind `{other}`"
            ))),
        }
    }
}

/// An in-memory object mapped to one storage record.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistentObject {
    oid: Oid,
    serial: Option<Tid>,
    location: Location,
    type_tag: String,
    fields: BTreeMap<String, Value>,
    changes: BTreeMap<String, Option<Value>>,
    new: bool,
    side_index: Option<Value>,
    partition: u32,
}

impl PersistentObject {
    /// Creates a new, unplaced object with a generated oid.
    pub fn new(type_tag: impl Into<String>) -> Self {
        Self::with_oid(Oid::generate(), type_tag)
    }

    /// Creates a new, unplaced object with a fixed oid.
    pub fn with_oid(oid: Oid, type_tag: impl Into<String>) -> Self {
        Self {
            oid,
            serial: None,
            location: Location::Detached,
            type_tag: type_tag.into(),
            fields: BTreeMap::new(),
            changes: BTreeMap::new(),
            new: true,
            side_index: None,
            partition: 0,
        }
    }

    /// Rebuilds a stored object. Used by readers.
    pub fn from_parts(
        oid: Oid,
        serial: Tid,
        location: Location,
        type_tag: impl Into<String>,
        fields: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            serial: Some(serial),
            location,
            fields,
            new: false,
            ..Self::with_oid(oid, type_tag)
        }
    }

    /// Sets a field without recording a change. For building new objects.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Object id.
    #[must_use]
    pub fn oid(&self) -> &Oid {
        &self.oid
    }

    /// Tid of the stored version this object was loaded from.
    #[must_use]
    pub fn serial(&self) -> Option<Tid> {
        self.serial
    }

    /// Current location.
    #[must_use]
    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Local name, if placed.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.location.name()
    }

    /// Tree parent, if any.
    #[must_use]
    pub fn parent_id(&self) -> Option<&Oid> {
        self.location.parent()
    }

    /// Annotation owner, if any.
    #[must_use]
    pub fn owner_id(&self) -> Option<&Oid> {
        self.location.owner()
    }

    /// Returns true if the object was deleted.
    #[must_use]
    pub fn is_trashed(&self) -> bool {
        self.location.is_trashed()
    }

    /// Entity kind.
    #[must_use]
    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    /// All fields.
    #[must_use]
    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    /// One field.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Returns true if the object has never been stored.
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.new
    }

    /// Returns true if any change was recorded.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        !self.changes.is_empty()
    }

    /// Recorded changes: change key to original value (`None` = absent).
    #[must_use]
    pub fn changes(&self) -> &BTreeMap<String, Option<Value>> {
        &self.changes
    }

    /// Structured search data handed to the backend untouched.
    #[must_use]
    pub fn side_index(&self) -> Option<&Value> {
        self.side_index.as_ref()
    }

    /// Partition key.
    #[must_use]
    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// Sets a field, recording its original value on first change.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        self.record_change(&name, self.fields.get(&name).cloned());
        self.fields.insert(name, value.into());
    }

    /// Removes a field, recording its original value on first change.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.record_change(name, self.fields.get(name).cloned());
        self.fields.remove(name)
    }

    /// Moves the object, recording the original location on first move.
    pub fn move_to(&mut self, location: Location) {
        self.record_change(LOCATION_KEY, Some(self.location.to_value()));
        self.location = location;
    }

    /// Sets the side index.
    pub fn set_side_index(&mut self, side_index: Option<Value>) {
        self.side_index = side_index;
    }

    /// Sets the partition key.
    pub fn set_partition(&mut self, partition: u32) {
        self.partition = partition;
    }

    /// Records `original` for `key` unless a value is already recorded.
    ///
    /// Returns true if this call recorded it.
    pub fn record_change(&mut self, key: &str, original: Option<Value>) -> bool {
        if self.changes.contains_key(key) {
            return false;
        }
        self.changes.insert(key.to_string(), original);
        true
    }

    /// Current value under a change key.
    #[must_use]
    pub fn change_value(&self, key: &str) -> Option<Value> {
        if key == LOCATION_KEY {
            Some(self.location.to_value())
        } else {
            self.fields.get(key).cloned()
        }
    }

    /// Writes a value under a change key without recording a change.
    pub fn apply_change(&mut self, key: &str, value: Option<Value>) -> CodecResult<()> {
        if key == LOCATION_KEY {
            if let Some(value) = value {
                self.location = Location::from_value(&value)?;
            }
            return Ok(());
        }
        match value {
            Some(value) => {
                self.fields.insert(key.to_string(), value);
            }
            None => {
                self.fields.remove(key);
            }
        }
        Ok(())
    }

    /// Keeps `other`'s state and merges its change set into ours.
    ///
    /// Originals recorded here first take precedence.
    pub fn merge(&mut self, other: PersistentObject) {
        for (key, original) in other.changes {
            self.changes.entry(key).or_insert(original);
        }
        self.fields = other.fields;
        self.location = other.location;
        self.side_index = other.side_index;
        self.partition = other.partition;
    }

    /// Takes the stored state of `fresh`, keeping location and changes.
    pub fn refresh_from(&mut self, fresh: PersistentObject) {
        self.fields = fresh.fields;
        self.serial = fresh.serial;
        self.new = false;
    }

    /// Adopts the change set of another version of this object.
    pub(crate) fn adopt_changes(&mut self, changes: BTreeMap<String, Option<Value>>) {
        self.changes = changes;
    }

    /// Places a new object without recording a move.
    pub(crate) fn place(&mut self, location: Location) {
        self.location = location;
    }

    /// Marks the object as stored under `tid`.
    pub(crate) fn mark_stored(&mut self, tid: Tid) {
        self.serial = Some(tid);
        self.new = false;
        self.changes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored() -> PersistentObject {
        let mut fields = BTreeMap::new();
        fields.insert("title".to_string(), Value::from("a"));
        PersistentObject::from_parts(
            Oid::new("x"),
            Tid::new(4),
            Location::child(Oid::root(), "x"),
            "item",
            fields,
        )
    }

    #[test]
    fn first_value_wins() {
        let mut obj = stored();
        obj.set("title", "b");
        obj.set("title", "c");
        assert_eq!(obj.changes()["title"], Some(Value::from("a")));
        assert_eq!(obj.get("title"), Some(&Value::from("c")));
    }

    #[test]
    fn added_field_records_absence() {
        let mut obj = stored();
        obj.set("body", "text");
        assert_eq!(obj.changes()["body"], None);
        assert!(obj.is_dirty());
    }

    #[test]
    fn remove_records_original() {
        let mut obj = stored();
        assert_eq!(obj.remove("title"), Some(Value::from("a")));
        assert_eq!(obj.changes()["title"], Some(Value::from("a")));
        assert!(obj.get("title").is_none());
    }

    #[test]
    fn move_records_original_location() {
        let mut obj = stored();
        obj.move_to(Location::child(Oid::new("p"), "y"));
        obj.move_to(Location::child(Oid::new("q"), "z"));
        let original = obj.changes()[LOCATION_KEY].clone().unwrap();
        assert_eq!(
            Location::from_value(&original).unwrap(),
            Location::child(Oid::root(), "x")
        );
        assert_eq!(obj.name(), Some("z"));
    }

    #[test]
    fn apply_change_moves_and_sets() {
        let mut obj = stored();
        let target = Location::annotation(Oid::new("o"), "meta");
        obj.apply_change(LOCATION_KEY, Some(target.to_value()))
            .unwrap();
        obj.apply_change("title", None).unwrap();
        assert_eq!(obj.location(), &target);
        assert!(obj.get("title").is_none());
        assert!(!obj.is_dirty());
    }

    #[test]
    fn merge_keeps_first_originals() {
        let mut a = stored();
        a.set("title", "b");
        let mut b = stored();
        b.set("title", "c");
        b.set("body", "d");
        a.merge(b);
        assert_eq!(a.changes()["title"], Some(Value::from("a")));
        assert_eq!(a.changes()["body"], None);
        assert_eq!(a.get("title"), Some(&Value::from("c")));
    }

    #[test]
    fn location_from_trashed_record() {
        let record = Record::new(Oid::new("x"), "item").with_parent(Oid::trashed(), "x");
        assert!(Location::from_record(&record).is_trashed());

        let record = Record::new(Oid::new("x"), "item").with_owner(Oid::new("o"), "k");
        assert_eq!(
            Location::from_record(&record),
            Location::annotation(Oid::new("o"), "k")
        );
    }

    #[test]
    fn mark_stored_clears_changes() {
        let mut obj = PersistentObject::new("item");
        obj.set("a", 1i64);
        obj.mark_stored(Tid::new(9));
        assert!(!obj.is_new());
        assert!(!obj.is_dirty());
        assert_eq!(obj.serial(), Some(Tid::new(9)));
    }
}
