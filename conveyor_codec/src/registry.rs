use crate::codec::{Codec, CodecDescriptor};
use crate::compressor::{Compressor, GzipCompressor, IdentityCompressor};
use crate::error::CodecError;
use crate::serializer::{JsonSerializer, MsgpackSerializer, Serializer};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

// Global default registry, for convenience wiring
static GLOBAL: OnceLock<Arc<CodecRegistry>> = OnceLock::new();

/// Holds the two orthogonal registries of the codec layer: serializers keyed
/// by content type and compressors keyed by name.
///
/// A fresh registry is pre-seeded with the built-ins (`application/json`,
/// `application/msgpack`; `none`, `gzip`). Custom implementations may be
/// [registered](CodecRegistry::register_serializer) on top; re-registering a
/// known name replaces the previous entry.
pub struct CodecRegistry {
    serializers: RwLock<HashMap<&'static str, Arc<dyn Serializer>>>,
    compressors: RwLock<HashMap<&'static str, Arc<dyn Compressor>>>,
}

impl CodecRegistry {
    /// Creates a registry pre-seeded with the built-in serializers and
    /// compressors.
    pub fn new() -> Self {
        let registry = Self {
            serializers: RwLock::new(HashMap::new()),
            compressors: RwLock::new(HashMap::new()),
        };

        registry.register_serializer(Arc::new(JsonSerializer));
        registry.register_serializer(Arc::new(MsgpackSerializer));
        registry.register_compressor(Arc::new(IdentityCompressor));
        registry.register_compressor(Arc::new(GzipCompressor));

        registry
    }

    /// Retrieves the process-wide default registry, lazily initialized.
    ///
    /// Components that are wired explicitly (notably in tests) should accept
    /// a registry instance instead of reaching for this.
    pub fn global() -> Arc<CodecRegistry> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::new())))
    }

    /// Registers the given serializer under its own content type.
    pub fn register_serializer(&self, serializer: Arc<dyn Serializer>) {
        self.serializers
            .write()
            .insert(serializer.content_type(), serializer);
    }

    /// Registers the given compressor under its own name.
    pub fn register_compressor(&self, compressor: Arc<dyn Compressor>) {
        self.compressors.write().insert(compressor.name(), compressor);
    }

    /// Looks up the serializer registered under the given content type.
    pub fn serializer(&self, content_type: &str) -> Result<Arc<dyn Serializer>, CodecError> {
        self.serializers
            .read()
            .get(content_type)
            .cloned()
            .ok_or_else(|| CodecError::UnknownContentType(content_type.to_string()))
    }

    /// Looks up the compressor registered under the given name.
    pub fn compressor(&self, compression: &str) -> Result<Arc<dyn Compressor>, CodecError> {
        self.compressors
            .read()
            .get(compression)
            .cloned()
            .ok_or_else(|| CodecError::UnknownCompression(compression.to_string()))
    }

    /// Resolves the given pair of names into a composed [`Codec`].
    pub fn resolve(&self, content_type: &str, compression: &str) -> Result<Codec, CodecError> {
        let serializer = self.serializer(content_type)?;
        let compressor = self.compressor(compression)?;

        Ok(Codec::new(serializer, compressor))
    }

    /// Resolves the given [`CodecDescriptor`] into a composed [`Codec`].
    pub fn codec(&self, descriptor: &CodecDescriptor) -> Result<Codec, CodecError> {
        self.resolve(&descriptor.content_type, &descriptor.compression)
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
    use crate::{COMPRESSION_GZIP, COMPRESSION_NONE, CONTENT_TYPE_JSON};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn resolves_built_ins() {
        // Given
        let registry = CodecRegistry::new();

        // When
        let codec = registry.resolve(CONTENT_TYPE_JSON, COMPRESSION_GZIP).unwrap();

        // Then
        assert_eq!(codec.content_type(), CONTENT_TYPE_JSON);
        assert_eq!(codec.compression(), COMPRESSION_GZIP);
    }

    #[test]
    fn identity_compressor_exists_under_none() {
        // Given
        let registry = CodecRegistry::new();

        // When
        let compressor = registry.compressor(COMPRESSION_NONE).unwrap();
        let bytes = compressor.compress(b"abc").unwrap();

        // Then
        assert_eq!(bytes, b"abc");
    }

    #[test]
    fn unknown_content_type_fails() {
        // Given
        let registry = CodecRegistry::new();

        // When
        let result = registry.resolve("application/xml", COMPRESSION_NONE);

        // Then
        assert!(matches!(result, Err(CodecError::UnknownContentType(_))));
    }

    #[test]
    fn unknown_compression_fails() {
        // Given
        let registry = CodecRegistry::new();

        // When
        let result = registry.resolve(CONTENT_TYPE_JSON, "zstd");

        // Then
        assert!(matches!(result, Err(CodecError::UnknownCompression(_))));
    }

    #[test]
    fn full_encode_decode_path() {
        // Given
        let registry = CodecRegistry::new();
        let codec = registry.resolve(CONTENT_TYPE_JSON, COMPRESSION_GZIP).unwrap();
        let value = json!({"payload": {"n": 1}});

        // When
        let bytes = codec.encode(&value).unwrap();
        let restored = codec.decode(&bytes).unwrap();

        // Then
        assert_eq!(restored, value);
    }
}
