#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(test, deny(warnings))]

/// Exposes the serializer half of the codec layer.
mod serializer;
pub use self::serializer::{JsonSerializer, MsgpackSerializer, Serializer};

/// Exposes the compressor half of the codec layer.
mod compressor;
pub use self::compressor::{Compressor, GzipCompressor, IdentityCompressor};

/// Exposes the composed codec and its descriptor.
mod codec;
pub use self::codec::{Codec, CodecDescriptor};

/// Exposes the registry that resolves descriptors into codecs.
mod registry;
pub use self::registry::CodecRegistry;

/// Exposes the codec error type.
mod error;
pub use self::error::CodecError;

/// The content type of the built-in JSON serializer.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// The content type of the built-in MessagePack serializer.
pub const CONTENT_TYPE_MSGPACK: &str = "application/msgpack";

/// The name of the built-in identity compressor.
pub const COMPRESSION_NONE: &str = "none";

/// The name of the built-in gzip compressor.
pub const COMPRESSION_GZIP: &str = "gzip";
