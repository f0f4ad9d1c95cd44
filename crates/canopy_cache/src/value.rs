//! Values held by the object cache.

use bytes::Bytes;
use canopy_codec::{
    optional_text, required, required_integer, required_text, CodecError, CodecResult, Decode,
    Encode, Value,
};
use canopy_storage::{Oid, Record, Tid};
use std::collections::BTreeMap;

/// The essential fields of a committed record.
///
/// Enough to rehydrate an object without a backend round-trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedRecord {
    /// Object id.
    pub oid: Oid,
    /// Serial of the cached version.
    pub tid: Tid,
    /// Name under the parent or owner.
    pub local_name: Option<String>,
    /// Tree parent.
    pub parent_id: Option<Oid>,
    /// Annotation owner.
    pub owner_id: Option<Oid>,
    /// Entity kind.
    pub type_tag: String,
    /// Codec that produced `state`.
    pub codec: String,
    /// Encoded state.
    pub state: Bytes,
}

impl CachedRecord {
    /// Rebuilds a record with these fields; side index and partition are not cached.
    #[must_use]
    pub fn to_record(&self) -> Record {
        Record {
            oid: self.oid.clone(),
            tid: self.tid,
            old_serial: None,
            parent_id: self.parent_id.clone(),
            owner_id: self.owner_id.clone(),
            local_name: self.local_name.clone(),
            type_tag: self.type_tag.clone(),
            codec: self.codec.clone(),
            state: self.state.clone(),
            side_index: None,
            partition: 0,
        }
    }
}

impl From<&Record> for CachedRecord {
    fn from(record: &Record) -> Self {
        Self {
            oid: record.oid.clone(),
            tid: record.tid,
            local_name: record.local_name.clone(),
            parent_id: record.parent_id.clone(),
            owner_id: record.owner_id.clone(),
            type_tag: record.type_tag.clone(),
            codec: record.codec.clone(),
            state: record.state.clone(),
        }
    }
}

/// An entry of the object cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheValue {
    /// A record, looked up by oid, child name or annotation name.
    Record(CachedRecord),
    /// Sorted child or annotation names.
    Keys(Vec<String>),
    /// Number of children.
    Count(u64),
    /// Known-missing annotation.
    Empty,
}

impl CacheValue {
    /// Approximate footprint used for eviction accounting.
    #[must_use]
    pub fn weight(&self) -> usize {
        match self {
            CacheValue::Record(rec) => rec.state.len().max(1),
            CacheValue::Keys(keys) => keys.iter().map(String::len).sum::<usize>().max(1),
            CacheValue::Count(_) => 8,
            CacheValue::Empty => 1,
        }
    }

    /// Returns the record if this is a `Record`.
    #[must_use]
    pub fn as_record(&self) -> Option<&CachedRecord> {
        match self {
            CacheValue::Record(rec) => Some(rec),
            _ => None,
        }
    }
}

impl From<&Record> for CacheValue {
    fn from(record: &Record) -> Self {
        CacheValue::Record(CachedRecord::from(record))
    }
}

pub(crate) fn encode_tid(tid: Tid) -> Value {
    i64::try_from(tid.as_u64()).map_or(Value::Null, Value::Integer)
}

pub(crate) fn tid_from_value(value: i64) -> CodecResult<Tid> {
    u64::try_from(value)
        .map(Tid::new)
        .map_err(|_| CodecError::invalid_structure(format!("negative tid {value}")))
}

fn optional_oid(oid: &Option<Oid>) -> Value {
    oid.as_ref().map_or(Value::Null, |o| Value::from(o.as_str()))
}

impl Encode for CacheValue {
    fn to_value(&self) -> Value {
        match self {
            CacheValue::Record(rec) => Value::map([
                ("kind", Value::from("record")),
                ("state", Value::Bytes(rec.state.clone())),
                ("oid", Value::from(rec.oid.as_str())),
                ("tid", encode_tid(rec.tid)),
                ("id", Value::from(rec.local_name.clone())),
                ("parent_id", optional_oid(&rec.parent_id)),
                ("owner_id", optional_oid(&rec.owner_id)),
                ("type", Value::from(rec.type_tag.as_str())),
                ("codec", Value::from(rec.codec.as_str())),
            ]),
            CacheValue::Keys(keys) => Value::map([
                ("kind", Value::from("keys")),
                (
                    "keys",
                    Value::Array(keys.iter().map(|k| Value::from(k.as_str())).collect()),
                ),
            ]),
            CacheValue::Count(n) => Value::map([
                ("kind", Value::from("len")),
                ("len", Value::Integer(i64::try_from(*n).unwrap_or(i64::MAX))),
            ]),
            CacheValue::Empty => Value::map([("kind", Value::from("empty"))]),
        }
    }
}

impl Decode for CacheValue {
    fn from_value(value: Value) -> CodecResult<Self> {
        let map = value.into_map()?;
        match required_text(&map, "kind")? {
            "record" => decode_record(&map).map(CacheValue::Record),
            "keys" => {
                let items = required(&map, "keys")?
                    .as_array()
                    .ok_or_else(|| CodecError::invalid_structure("`keys` is not an array"))?;
                items
                    .iter()
                    .map(|v| {
                        v.as_text()
                            .map(str::to_string)
                            .ok_or_else(|| CodecError::invalid_structure("key is not text"))
                    })
                    .collect::<CodecResult<Vec<_>>>()
                    .map(CacheValue::Keys)
            }
            "len" => {
                let n = required_integer(&map, "len")?;
                u64::try_from(n)
                    .map(CacheValue::Count)
                    .map_err(|_| CodecError::invalid_structure("negative length"))
            }
            "empty" => Ok(CacheValue::Empty),
            other => Err(CodecError::invalid_structure(format!(
                "unknown cache value kind `{other}`"
            ))),
        }
    }
}

fn decode_record(map: &BTreeMap<String, Value>) -> CodecResult<CachedRecord> {
    let state = required(map, "state")?
        .as_bytes()
        .cloned()
        .ok_or_else(|| CodecError::invalid_structure("`state` is not bytes"))?;
    Ok(CachedRecord {
        oid: Oid::new(required_text(map, "oid")?),
        tid: tid_from_value(required_integer(map, "tid")?)?,
        local_name: optional_text(map, "id")?,
        parent_id: optional_text(map, "parent_id")?.map(Oid::new),
        owner_id: optional_text(map, "owner_id")?.map(Oid::new),
        type_tag: required_text(map, "type")?.to_string(),
        codec: required_text(map, "codec")?.to_string(),
        state,
    })
}
