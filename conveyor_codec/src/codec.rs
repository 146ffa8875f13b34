use crate::error::CodecError;
use crate::{COMPRESSION_NONE, CONTENT_TYPE_JSON, Compressor, Serializer};
use serde::Deserialize;
use serde_json::Value;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Identifies a [`Codec`] by its (content type, compression) pair.
///
/// This is the form in which a codec appears in broker definitions; the
/// [`CodecRegistry`](crate::CodecRegistry) resolves it into a working codec.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(default)]
pub struct CodecDescriptor {
    /// The content type of the serializer half.
    pub content_type: String,
    /// The name of the compressor half.
    pub compression: String,
}

impl Default for CodecDescriptor {
    fn default() -> Self {
        Self {
            content_type: CONTENT_TYPE_JSON.to_string(),
            compression: COMPRESSION_NONE.to_string(),
        }
    }
}

impl CodecDescriptor {
    /// Creates a descriptor from the given pair of names.
    pub fn new(content_type: impl AsRef<str>, compression: impl AsRef<str>) -> Self {
        Self {
            content_type: content_type.as_ref().to_string(),
            compression: compression.as_ref().to_string(),
        }
    }
}

impl Display for CodecDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}+{}", self.content_type, self.compression)
    }
}

/// A working codec: one serializer composed with one compressor.
///
/// The full encoding of an envelope dictionary is
/// `compress(dumps(dictionary))`; decoding is the exact inverse. The two
/// halves stay independently addressable because the compression name travels
/// in a transport header, separate from the content type.
#[derive(Clone)]
pub struct Codec {
    serializer: Arc<dyn Serializer>,
    compressor: Arc<dyn Compressor>,
}

impl Codec {
    /// Composes a codec from the given halves.
    pub fn new(serializer: Arc<dyn Serializer>, compressor: Arc<dyn Compressor>) -> Self {
        Self {
            serializer,
            compressor,
        }
    }

    /// Reports the content type of the serializer half.
    pub fn content_type(&self) -> &'static str {
        self.serializer.content_type()
    }

    /// Reports the name of the compressor half.
    pub fn compression(&self) -> &'static str {
        self.compressor.name()
    }

    /// Turns the given envelope dictionary into serialized bytes.
    pub fn dumps(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        self.serializer.dumps(value)
    }

    /// Turns serialized bytes back into an envelope dictionary.
    pub fn loads(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        self.serializer.loads(bytes)
    }

    /// Compresses the given serialized bytes.
    pub fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        self.compressor.compress(bytes)
    }

    /// Decompresses the given wire bytes.
    pub fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        self.compressor.decompress(bytes)
    }

    /// Shorthand for the full encoding path: `compress(dumps(value))`.
    pub fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        let serialized = self.dumps(value)?;

        self.compress(&serialized)
    }

    /// Shorthand for the full decoding path: `loads(decompress(bytes))`.
    pub fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        let decompressed = self.decompress(bytes)?;

        self.loads(&decompressed)
    }

    /// Reports the descriptor of this codec.
    pub fn descriptor(&self) -> CodecDescriptor {
        CodecDescriptor::new(self.content_type(), self.compression())
    }
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec")
            .field("content_type", &self.content_type())
            .field("compression", &self.compression())
            .finish()
    }
}
