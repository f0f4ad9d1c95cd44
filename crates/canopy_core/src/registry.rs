//! Writers, readers and resolvers selected by entity kind.
//!
//! A [`KindRegistry`] is built once at startup and handed to the
//! transaction manager. Lookups are exact by type tag and fall back to the
//! [`GENERIC_KIND`] entries for kinds nobody registered.

use crate::error::{CoreResult, UnresolvableConflict};
use crate::object::{Location, PersistentObject};
use canopy_codec::{Codec, CodecRegistry, Value};
use canopy_storage::{Oid, Record, Tid};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Fallback kind for unregistered entities.
pub const GENERIC_KIND: &str = "generic";

/// Kind of annotation objects.
pub const ANNOTATION_KIND: &str = "annotation";

/// Kind of the repository root.
pub const ROOT_KIND: &str = "root";

/// Turns an object into a storage record.
///
/// Every accessor has a default reading the object itself; writers
/// override what their kind stores differently.
pub trait Writer: Send + Sync {
    /// Encodes the object's state.
    fn serialize(&self, object: &PersistentObject, codec: &dyn Codec) -> CoreResult<Vec<u8>>;

    /// Structured search data stored next to the state.
    fn get_side_index(&self, object: &PersistentObject) -> Option<Value> {
        object.side_index().cloned()
    }

    /// Stored type tag.
    fn type_tag(&self, object: &PersistentObject) -> String {
        object.type_tag().to_string()
    }

    /// Annotation owner.
    fn owner(&self, object: &PersistentObject) -> Option<Oid> {
        object.owner_id().cloned()
    }

    /// Serial the write is based on.
    fn old_serial(&self, object: &PersistentObject) -> Option<Tid> {
        object.serial()
    }

    /// Partition key.
    fn partition(&self, object: &PersistentObject) -> u32 {
        object.partition()
    }

    /// Name under the parent or owner.
    fn local_name(&self, object: &PersistentObject) -> Option<String> {
        object.name().map(str::to_string)
    }

    /// Tree parent.
    fn parent_id(&self, object: &PersistentObject) -> Option<Oid> {
        object.parent_id().cloned()
    }

    /// Builds the full record.
    fn to_record(&self, object: &PersistentObject, codec: &dyn Codec) -> CoreResult<Record> {
        let state = self.serialize(object, codec)?;
        let mut record = Record::new(object.oid().clone(), self.type_tag(object))
            .with_state(codec.name(), state)
            .with_old_serial(self.old_serial(object))
            .with_side_index(self.get_side_index(object))
            .with_partition(self.partition(object));
        record.local_name = self.local_name(object);
        record.owner_id = self.owner(object);
        record.parent_id = self.parent_id(object);
        Ok(record)
    }
}

/// Rehydrates an object from a stored record.
pub trait Reader: Send + Sync {
    /// Builds the object, setting oid, serial and location from the record.
    fn read(&self, record: &Record, codec: &dyn Codec) -> CoreResult<PersistentObject>;
}

/// Merges a transaction's changes onto a concurrently committed version.
pub trait Resolver: Send + Sync {
    /// Returns the merged object, or the conflict if both sides touched
    /// the same field.
    fn resolve(
        &self,
        ours: &PersistentObject,
        theirs: PersistentObject,
    ) -> Result<PersistentObject, UnresolvableConflict>;
}

/// Stores every field as one map.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldWriter;

impl Writer for FieldWriter {
    fn serialize(&self, object: &PersistentObject, codec: &dyn Codec) -> CoreResult<Vec<u8>> {
        Ok(codec.encode(&Value::Map(object.fields().clone()))?)
    }
}

/// Reads state written by [`FieldWriter`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldReader;

impl Reader for FieldReader {
    fn read(&self, record: &Record, codec: &dyn Codec) -> CoreResult<PersistentObject> {
        let fields = if record.state.is_empty() {
            Default::default()
        } else {
            codec.decode(&record.state)?.into_map()?
        };
        let mut object = PersistentObject::from_parts(
            record.oid.clone(),
            record.tid,
            Location::from_record(record),
            record.type_tag.clone(),
            fields,
        );
        object.set_side_index(record.side_index.clone());
        object.set_partition(record.partition);
        Ok(object)
    }
}

/// Field-granular resolver.
///
/// For each change key: if the committed version holds a value that
/// differs from the recorded original, both sides touched it and the
/// conflict is unresolvable; otherwise our value is written onto the
/// committed version, which becomes the result.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldResolver;

impl FieldResolver {
    fn splice(
        ours: &PersistentObject,
        theirs: PersistentObject,
    ) -> Result<PersistentObject, UnresolvableConflict> {
        let conflict =
            |theirs: &PersistentObject, key: Option<&str>| -> UnresolvableConflict {
                UnresolvableConflict::new(ours.clone(), theirs.clone(), key.map(str::to_string))
            };
        if theirs.is_trashed() {
            return Err(conflict(&theirs, None));
        }
        let mut merged = theirs.clone();
        for (key, original) in ours.changes() {
            if let Some(current) = merged.change_value(key) {
                if Some(&current) != original.as_ref() {
                    return Err(conflict(&theirs, Some(key.as_str())));
                }
            }
            merged
                .apply_change(key, ours.change_value(key))
                .map_err(|_| conflict(&theirs, Some(key.as_str())))?;
        }
        Ok(merged)
    }
}

impl Resolver for FieldResolver {
    fn resolve(
        &self,
        ours: &PersistentObject,
        theirs: PersistentObject,
    ) -> Result<PersistentObject, UnresolvableConflict> {
        Self::splice(ours, theirs)
    }
}

/// Resolver for annotations.
///
/// Entries merge like fields, but only while the committed annotation still
/// belongs to the same owner.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnnotationResolver;

impl Resolver for AnnotationResolver {
    fn resolve(
        &self,
        ours: &PersistentObject,
        theirs: PersistentObject,
    ) -> Result<PersistentObject, UnresolvableConflict> {
        if theirs.is_trashed() || theirs.owner_id() != ours.owner_id() {
            return Err(UnresolvableConflict::new(ours.clone(), theirs, None));
        }
        FieldResolver::splice(ours, theirs)
    }
}

/// Resolver that refuses every merge.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverMerge;

impl Resolver for NeverMerge {
    fn resolve(
        &self,
        ours: &PersistentObject,
        theirs: PersistentObject,
    ) -> Result<PersistentObject, UnresolvableConflict> {
        Err(UnresolvableConflict::new(ours.clone(), theirs, None))
    }
}

/// Writer, reader and resolver tables plus the state codecs.
pub struct KindRegistry {
    codecs: CodecRegistry,
    writers: HashMap<String, Arc<dyn Writer>>,
    readers: HashMap<String, Arc<dyn Reader>>,
    resolvers: HashMap<String, Arc<dyn Resolver>>,
}

impl KindRegistry {
    /// Creates a registry with the generic and annotation entries and the
    /// default codecs.
    #[must_use]
    pub fn new() -> Self {
        Self::with_codecs(CodecRegistry::new())
    }

    /// Creates a registry over an existing codec registry.
    #[must_use]
    pub fn with_codecs(codecs: CodecRegistry) -> Self {
        let mut registry = Self {
            codecs,
            writers: HashMap::new(),
            readers: HashMap::new(),
            resolvers: HashMap::new(),
        };
        registry.register_writer(GENERIC_KIND, Arc::new(FieldWriter));
        registry.register_reader(GENERIC_KIND, Arc::new(FieldReader));
        registry.register_resolver(GENERIC_KIND, Arc::new(FieldResolver));
        registry.register_resolver(ANNOTATION_KIND, Arc::new(AnnotationResolver));
        registry
    }

    /// Registers a writer for `kind`.
    pub fn register_writer(&mut self, kind: &str, writer: Arc<dyn Writer>) {
        self.writers.insert(kind.to_string(), writer);
    }

    /// Registers a reader for `kind`.
    pub fn register_reader(&mut self, kind: &str, reader: Arc<dyn Reader>) {
        self.readers.insert(kind.to_string(), reader);
    }

    /// Registers a resolver for `kind`.
    pub fn register_resolver(&mut self, kind: &str, resolver: Arc<dyn Resolver>) {
        self.resolvers.insert(kind.to_string(), resolver);
    }

    /// Codec tables.
    #[must_use]
    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    /// Mutable codec tables.
    pub fn codecs_mut(&mut self) -> &mut CodecRegistry {
        &mut self.codecs
    }

    fn lookup<'a, T: ?Sized>(
        table: &'a HashMap<String, Arc<T>>,
        kind: &str,
    ) -> Option<&'a Arc<T>> {
        table.get(kind).or_else(|| table.get(GENERIC_KIND))
    }

    /// Writer for `kind`, or the generic one.
    #[must_use]
    pub fn writer(&self, kind: &str) -> Arc<dyn Writer> {
        match Self::lookup(&self.writers, kind) {
            Some(writer) => Arc::clone(writer),
            None => Arc::new(FieldWriter),
        }
    }

    /// Reader for `kind`, or the generic one.
    #[must_use]
    pub fn reader(&self, kind: &str) -> Arc<dyn Reader> {
        match Self::lookup(&self.readers, kind) {
            Some(reader) => Arc::clone(reader),
            None => Arc::new(FieldReader),
        }
    }

    /// Resolver for `kind`, or the generic one.
    #[must_use]
    pub fn resolver(&self, kind: &str) -> Arc<dyn Resolver> {
        match Self::lookup(&self.resolvers, kind) {
            Some(resolver) => Arc::clone(resolver),
            None => Arc::new(FieldResolver),
        }
    }

    /// Encodes an object with its kind's writer and the default codec.
    pub fn encode(&self, object: &PersistentObject) -> CoreResult<Record> {
        let codec = self.codecs.default_codec();
        self.writer(object.type_tag())
            .to_record(object, codec.as_ref())
    }

    /// Decodes a record with its kind's reader and the codec it names.
    pub fn decode(&self, record: &Record) -> CoreResult<PersistentObject> {
        let codec = self.codecs.get(&record.codec)?;
        self.reader(&record.type_tag).read(record, codec.as_ref())
    }
}

impl Default for KindRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for KindRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut writers: Vec<_> = self.writers.keys().collect();
        writers.sort();
        let mut resolvers: Vec<_> = self.resolvers.keys().collect();
        resolvers.sort();
        f.debug_struct("KindRegistry")
            .field("codecs", &self.codecs.names())
            .field("writers", &writers)
            .field("resolvers", &resolvers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::LOCATION_KEY;
    use canopy_codec::JSON;

    fn committed(fields: &[(&str, &str)], tid: u64) -> PersistentObject {
        PersistentObject::from_parts(
            Oid::new("x"),
            Tid::new(tid),
            Location::child(Oid::root(), "x"),
            "item",
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), Value::from(*v)))
                .collect(),
        )
    }

    #[test]
    fn encode_decode_preserves_fields_and_location() {
        let registry = KindRegistry::new();
        let mut obj = PersistentObject::new("item").with_field("title", "hello");
        obj.place(Location::child(Oid::root(), "doc"));

        let mut record = registry.encode(&obj).unwrap();
        assert_eq!(record.parent_id, Some(Oid::root()));
        assert_eq!(record.local_name.as_deref(), Some("doc"));
        assert_eq!(record.old_serial, None);

        record.tid = Tid::new(7);
        let back = registry.decode(&record).unwrap();
        assert_eq!(back.get("title"), Some(&Value::from("hello")));
        assert_eq!(back.serial(), Some(Tid::new(7)));
        assert_eq!(back.name(), Some("doc"));
    }

    #[test]
    fn decode_uses_record_codec() {
        let mut registry = KindRegistry::new();
        registry.codecs_mut().set_default(JSON).unwrap();
        let obj = PersistentObject::new("item").with_field("n", 3i64);
        let record = registry.encode(&obj).unwrap();
        assert_eq!(record.codec, JSON);

        let cbor_default = KindRegistry::new();
        assert_eq!(
            cbor_default.decode(&record).unwrap().get("n"),
            Some(&Value::Integer(3))
        );
    }

    #[test]
    fn annotation_owner_written() {
        let registry = KindRegistry::new();
        let mut obj = PersistentObject::new(ANNOTATION_KIND);
        obj.place(Location::annotation(Oid::new("o"), "meta"));
        let record = registry.encode(&obj).unwrap();
        assert_eq!(record.owner_id, Some(Oid::new("o")));
        assert_eq!(record.parent_id, None);
    }

    #[test]
    fn disjoint_fields_merge_onto_theirs() {
        let mut ours = committed(&[("a", "1"), ("b", "1")], 1);
        ours.set("a", "ours");
        let theirs = committed(&[("a", "1"), ("b", "theirs")], 2);

        let merged = FieldResolver.resolve(&ours, theirs).unwrap();
        assert_eq!(merged.get("a"), Some(&Value::from("ours")));
        assert_eq!(merged.get("b"), Some(&Value::from("theirs")));
        assert_eq!(merged.serial(), Some(Tid::new(2)));
    }

    #[test]
    fn same_field_is_unresolvable() {
        let mut ours = committed(&[("a", "1")], 1);
        ours.set("a", "ours");
        let theirs = committed(&[("a", "theirs")], 2);

        let conflict = FieldResolver.resolve(&ours, theirs).unwrap_err();
        assert_eq!(conflict.key.as_deref(), Some("a"));
        assert_eq!(conflict.theirs.get("a"), Some(&Value::from("theirs")));
    }

    #[test]
    fn field_removed_by_them_is_not_a_conflict() {
        let mut ours = committed(&[("a", "1")], 1);
        ours.set("a", "ours");
        let theirs = committed(&[], 2);
        let merged = FieldResolver.resolve(&ours, theirs).unwrap();
        assert_eq!(merged.get("a"), Some(&Value::from("ours")));
    }

    #[test]
    fn field_added_by_both_conflicts() {
        let mut ours = committed(&[], 1);
        ours.set("a", "ours");
        let theirs = committed(&[("a", "theirs")], 2);
        assert!(FieldResolver.resolve(&ours, theirs).is_err());
    }

    #[test]
    fn concurrent_moves_conflict() {
        let mut ours = committed(&[], 1);
        ours.move_to(Location::child(Oid::root(), "mine"));
        let mut theirs = committed(&[], 2);
        theirs.place(Location::child(Oid::root(), "theirs"));

        let conflict = FieldResolver.resolve(&ours, theirs).unwrap_err();
        assert_eq!(conflict.key.as_deref(), Some(LOCATION_KEY));
    }

    #[test]
    fn move_and_edit_merge() {
        let mut ours = committed(&[("a", "1")], 1);
        ours.move_to(Location::child(Oid::root(), "moved"));
        let theirs = committed(&[("a", "2")], 2);

        let merged = FieldResolver.resolve(&ours, theirs).unwrap();
        assert_eq!(merged.name(), Some("moved"));
        assert_eq!(merged.get("a"), Some(&Value::from("2")));
    }

    #[test]
    fn trashed_version_is_unresolvable() {
        let mut ours = committed(&[("a", "1")], 1);
        ours.set("a", "2");
        let mut theirs = committed(&[("a", "1")], 2);
        theirs.place(Location::child(Oid::trashed(), "x"));
        assert!(FieldResolver.resolve(&ours, theirs).is_err());
    }

    #[test]
    fn annotation_requires_same_owner() {
        let annotation = |owner: &str, tid: u64| {
            PersistentObject::from_parts(
                Oid::new("n"),
                Tid::new(tid),
                Location::annotation(Oid::new(owner), "meta"),
                ANNOTATION_KIND,
                Default::default(),
            )
        };
        let mut ours = annotation("o", 1);
        ours.set("k", "v");

        assert!(AnnotationResolver.resolve(&ours, annotation("o", 2)).is_ok());
        assert!(AnnotationResolver
            .resolve(&ours, annotation("other", 2))
            .is_err());
    }

    #[test]
    fn never_merge_always_refuses() {
        let ours = committed(&[], 1);
        assert!(NeverMerge.resolve(&ours, committed(&[], 2)).is_err());
    }

    #[test]
    fn unknown_kinds_fall_back_to_generic() {
        let mut registry = KindRegistry::new();
        registry.register_resolver("frozen", Arc::new(NeverMerge));
        let ours = committed(&[], 1);

        assert!(registry
            .resolver("anything")
            .resolve(&ours, committed(&[], 2))
            .is_ok());
        assert!(registry
            .resolver("frozen")
            .resolve(&ours, committed(&[], 2))
            .is_err());
    }
}
