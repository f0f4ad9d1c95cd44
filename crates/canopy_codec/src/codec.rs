//! Pluggable state codecs.

use crate::error::{CodecError, CodecResult};
use crate::value::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Name of the CBOR codec.
pub const CBOR: &str = "cbor";
/// Name of the JSON codec.
pub const JSON: &str = "json";

/// A byte-level encoding for [`Value`]s.
///
/// Each stored record remembers the name of the codec that produced its
/// state, so readers can decode records written under a different default.
pub trait Codec: Send + Sync + fmt::Debug {
    /// Stable name stored next to encoded records.
    fn name(&self) -> &str;

    /// Encodes a value to bytes.
    fn encode(&self, value: &Value) -> CodecResult<Vec<u8>>;

    /// Decodes bytes previously produced by [`Codec::encode`].
    fn decode(&self, bytes: &[u8]) -> CodecResult<Value>;
}

/// CBOR codec backed by `ciborium`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CborCodec;

impl Codec for CborCodec {
    fn name(&self) -> &str {
        CBOR
    }

    fn encode(&self, value: &Value) -> CodecResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(value, &mut buf)
            .map_err(|e| CodecError::encoding_failed(e.to_string()))?;
        Ok(buf)
    }

    fn decode(&self, bytes: &[u8]) -> CodecResult<Value> {
        ciborium::de::from_reader(bytes).map_err(|e| CodecError::decoding_failed(e.to_string()))
    }
}

/// JSON codec backed by `serde_json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &str {
        JSON
    }

    fn encode(&self, value: &Value) -> CodecResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| CodecError::encoding_failed(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> CodecResult<Value> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::decoding_failed(e.to_string()))
    }
}

/// Registry of codecs by name, with a designated default.
#[derive(Debug, Clone)]
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn Codec>>,
    default: String,
}

impl CodecRegistry {
    /// Creates a registry holding the CBOR and JSON codecs, defaulting to CBOR.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Self {
            codecs: HashMap::new(),
            default: CBOR.to_string(),
        };
        registry.register(Arc::new(CborCodec));
        registry.register(Arc::new(JsonCodec));
        registry
    }

    /// Creates the standard registry with `name` as default.
    pub fn with_default(name: &str) -> CodecResult<Self> {
        let mut registry = Self::new();
        registry.set_default(name)?;
        Ok(registry)
    }

    /// Registers a codec, replacing any codec with the same name.
    pub fn register(&mut self, codec: Arc<dyn Codec>) {
        self.codecs.insert(codec.name().to_string(), codec);
    }

    /// Changes the default codec.
    pub fn set_default(&mut self, name: &str) -> CodecResult<()> {
        if !self.codecs.contains_key(name) {
            return Err(CodecError::unknown_codec(name));
        }
        self.default = name.to_string();
        Ok(())
    }

    /// Looks up a codec by name.
    pub fn get(&self, name: &str) -> CodecResult<Arc<dyn Codec>> {
        self.codecs
            .get(name)
            .cloned()
            .ok_or_else(|| CodecError::unknown_codec(name))
    }

    /// Returns the default codec.
    #[must_use]
    pub fn default_codec(&self) -> Arc<dyn Codec> {
        // set_default only accepts registered names and nothing unregisters.
        match self.codecs.get(&self.default) {
            Some(codec) => Arc::clone(codec),
            None => Arc::new(CborCodec),
        }
    }

    /// Name of the default codec.
    #[must_use]
    pub fn default_name(&self) -> &str {
        &self.default
    }

    /// Names of all registered codecs, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.codecs.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn sample() -> Value {
        Value::map([
            ("title", Value::from("hello")),
            ("count", Value::from(-3)),
            ("flags", Value::Array(vec![Value::from(true), Value::Null])),
            ("raw", Value::Bytes(Bytes::from_static(b"\x00\x01"))),
        ])
    }

    #[test]
    fn cbor_roundtrip_preserves_value() {
        let codec = CborCodec;
        let bytes = codec.encode(&sample()).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), sample());
    }

    #[test]
    fn json_roundtrip_preserves_value() {
        let codec = JsonCodec;
        let bytes = codec.encode(&sample()).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), sample());
    }

    #[test]
    fn equal_values_encode_identically() {
        let a = Value::map([("x", Value::from(1)), ("y", Value::from(2))]);
        let b = Value::map([("y", Value::from(2)), ("x", Value::from(1))]);
        assert_eq!(CborCodec.encode(&a).unwrap(), CborCodec.encode(&b).unwrap());
    }

    #[test]
    fn decode_garbage_fails() {
        assert!(matches!(
            CborCodec.decode(&[0xff, 0x00]),
            Err(CodecError::DecodingFailed { .. })
        ));
        assert!(JsonCodec.decode(b"{not json").is_err());
    }

    #[test]
    fn registry_defaults_to_cbor() {
        let registry = CodecRegistry::new();
        assert_eq!(registry.default_name(), CBOR);
        assert_eq!(registry.default_codec().name(), CBOR);
        assert_eq!(registry.names(), vec!["cbor".to_string(), "json".to_string()]);
    }

    #[test]
    fn registry_rejects_unknown_default() {
        assert!(matches!(
            CodecRegistry::with_default("msgpack"),
            Err(CodecError::UnknownCodec { .. })
        ));
        let registry = CodecRegistry::with_default(JSON).unwrap();
        assert_eq!(registry.default_codec().name(), JSON);
    }
}
