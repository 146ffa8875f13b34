use crate::error::CodecError;
use crate::{COMPRESSION_GZIP, COMPRESSION_NONE};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};

/// Represents a way of compressing and decompressing the serialized bytes of
/// an envelope.
///
/// A compressor is registered under its [name](Compressor::name), which also
/// travels in a transport header alongside every published message, so that
/// the receiving side can decompress without sharing configuration with the
/// sender.
pub trait Compressor: Send + Sync {
    /// Reports the name under which this compressor is known.
    fn name(&self) -> &'static str;

    /// Compresses the given bytes.
    fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError>;

    /// Decompresses the given bytes.
    fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError>;
}

/// The built-in identity compressor, registered under the name `none`.
#[derive(Debug, Default)]
pub struct IdentityCompressor;

impl Compressor for IdentityCompressor {
    fn name(&self) -> &'static str {
        COMPRESSION_NONE
    }

    fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(bytes.to_vec())
    }

    fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(bytes.to_vec())
    }
}

/// The built-in gzip compressor, registered under the name `gzip`.
#[derive(Debug, Default)]
pub struct GzipCompressor;

impl Compressor for GzipCompressor {
    fn name(&self) -> &'static str {
        COMPRESSION_GZIP
    }

    fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        let into_error = |error: std::io::Error| CodecError::Compress {
            compression: COMPRESSION_GZIP.to_string(),
            message: error.to_string(),
        };

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());

        encoder.write_all(bytes).map_err(into_error)?;

        encoder.finish().map_err(into_error)
    }

    fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut decoder = GzDecoder::new(bytes);
        let mut decompressed = Vec::new();

        decoder
            .read_to_end(&mut decompressed)
            .map(|_| decompressed)
            .map_err(|error| CodecError::Decompress {
                compression: self.name().to_string(),
                message: error.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn identity_round_trip() {
        // Given
        let compressor = IdentityCompressor;
        let bytes = b"plain bytes".to_vec();

        // When
        let compressed = compressor.compress(&bytes).unwrap();
        let decompressed = compressor.decompress(&compressed).unwrap();

        // Then
        assert_eq!(compressed, bytes);
        assert_eq!(decompressed, bytes);
    }

    #[test]
    fn gzip_round_trip() {
        // Given
        let compressor = GzipCompressor;
        let bytes = b"a body that is long enough to actually shrink under gzip \
                      a body that is long enough to actually shrink under gzip"
            .to_vec();

        // When
        let compressed = compressor.compress(&bytes).unwrap();
        let decompressed = compressor.decompress(&compressed).unwrap();

        // Then
        assert_eq!(decompressed, bytes);
        assert!(compressed.len() < bytes.len());
    }

    #[test]
    fn gzip_rejects_gibberish() {
        // Given
        let compressor = GzipCompressor;

        // When
        let result = compressor.decompress(b"definitely not gzip");

        // Then
        assert!(matches!(result, Err(CodecError::Decompress { .. })));
    }
}
