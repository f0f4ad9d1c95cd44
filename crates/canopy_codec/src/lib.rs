//! # Canopy Codec
//!
//! Value model and pluggable state codecs for Canopy.
//!
//! Object state, side indexes and cache invalidation messages are all
//! expressed as [`Value`] trees. A [`Codec`] turns those trees into bytes;
//! two codecs ship with the crate:
//!
//! - [`CborCodec`] (`"cbor"`), the default, compact binary
//! - [`JsonCodec`] (`"json"`), human readable, used by the CLI
//!
//! Every stored record carries the name of the codec that wrote it, so a
//! [`CodecRegistry`] can always pick the right decoder.
//!
//! ## Usage
//!
//! ```
//! use canopy_codec::{Codec, CodecRegistry, Value};
//!
//! let registry = CodecRegistry::new();
//! let codec = registry.default_codec();
//!
//! let value = Value::map([("title", Value::from("hello"))]);
//! let bytes = codec.encode(&value).unwrap();
//! assert_eq!(codec.decode(&bytes).unwrap(), value);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod error;
mod value;

pub use codec::{CborCodec, Codec, CodecRegistry, JsonCodec, CBOR, JSON};
pub use error::{CodecError, CodecResult};
pub use value::{optional_text, required, required_integer, required_text, Value};

/// Types that can be represented as a [`Value`].
pub trait Encode {
    /// Converts this type into a value tree.
    fn to_value(&self) -> Value;

    /// Encodes this type with the given codec.
    fn encode(&self, codec: &dyn Codec) -> CodecResult<Vec<u8>> {
        codec.encode(&self.to_value())
    }
}

/// Types that can be rebuilt from a [`Value`].
pub trait Decode: Sized {
    /// Rebuilds this type from a value tree.
    fn from_value(value: Value) -> CodecResult<Self>;

    /// Decodes this type with the given codec.
    fn decode(codec: &dyn Codec, bytes: &[u8]) -> CodecResult<Self> {
        Self::from_value(codec.decode(bytes)?)
    }
}

impl Encode for Value {
    fn to_value(&self) -> Value {
        self.clone()
    }
}

impl Decode for Value {
    fn from_value(value: Value) -> CodecResult<Self> {
        Ok(value)
    }
}
