//! Invalidation messages exchanged over the pub/sub channel.

use crate::value::{encode_tid, tid_from_value, CacheValue};
use canopy_codec::{required, required_integer, CodecError, CodecResult, Decode, Encode, Value};
use canopy_storage::Tid;
use std::collections::BTreeMap;

/// Tells every process which keys a commit made stale.
///
/// Wire form: `{tid, keys: [string], pushed: {key -> value}}`, encoded with
/// the record codec.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InvalidationMessage {
    /// Committing transaction.
    pub tid: Tid,
    /// Keys to drop.
    pub keys: Vec<String>,
    /// Fresh values to install in place of dropped keys.
    pub pushed: BTreeMap<String, CacheValue>,
}

impl InvalidationMessage {
    /// Creates a message with nothing to push.
    #[must_use]
    pub fn new(tid: Tid, keys: Vec<String>) -> Self {
        Self {
            tid,
            keys,
            pushed: BTreeMap::new(),
        }
    }
}

impl Encode for InvalidationMessage {
    fn to_value(&self) -> Value {
        Value::map([
            ("tid", encode_tid(self.tid)),
            (
                "keys",
                Value::Array(self.keys.iter().map(|k| Value::from(k.as_str())).collect()),
            ),
            (
                "pushed",
                Value::Map(
                    self.pushed
                        .iter()
                        .map(|(k, v)| (k.clone(), v.to_value()))
                        .collect(),
                ),
            ),
        ])
    }
}

impl Decode for InvalidationMessage {
    fn from_value(value: Value) -> CodecResult<Self> {
        let mut map = value.into_map()?;
        let tid = tid_from_value(required_integer(&map, "tid")?)?;
        let keys = required(&map, "keys")?
            .as_array()
            .ok_or_else(|| CodecError::invalid_structure("`keys` is not an array"))?
            .iter()
            .map(|k| {
                k.as_text()
                    .map(str::to_string)
                    .ok_or_else(|| CodecError::invalid_structure("key is not text"))
            })
            .collect::<CodecResult<Vec<_>>>()?;
        let pushed = match map.remove("pushed") {
            None | Some(Value::Null) => BTreeMap::new(),
            Some(value) => value
                .into_map()?
                .into_iter()
                .map(|(k, v)| CacheValue::from_value(v).map(|v| (k, v)))
                .collect::<CodecResult<_>>()?,
        };
        Ok(Self { tid, keys, pushed })
    }
}
