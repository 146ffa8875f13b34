use thiserror::Error;

/// Represents a failure within the codec layer.
#[derive(Error, Debug)]
pub enum CodecError {
    /// The requested content type is not present in the serializer registry.
    #[error("unknown content type '{0}'")]
    UnknownContentType(String),

    /// The requested compression is not present in the compressor registry.
    #[error("unknown compression '{0}'")]
    UnknownCompression(String),

    /// The serializer failed to turn an envelope dictionary into bytes.
    #[error("failed to serialize as '{content_type}': {message}")]
    Serialize {
        /// The content type of the serializer that failed.
        content_type: String,
        /// The underlying error, stringified.
        message: String,
    },

    /// The serializer failed to turn bytes back into an envelope dictionary.
    #[error("failed to deserialize as '{content_type}': {message}")]
    Deserialize {
        /// The content type of the serializer that failed.
        content_type: String,
        /// The underlying error, stringified.
        message: String,
    },

    /// The compressor failed to compress the given bytes.
    #[error("failed to compress with '{compression}': {message}")]
    Compress {
        /// The name of the compressor that failed.
        compression: String,
        /// The underlying error, stringified.
        message: String,
    },

    /// The compressor failed to decompress the given bytes.
    #[error("failed to decompress with '{compression}': {message}")]
    Decompress {
        /// The name of the compressor that failed.
        compression: String,
        /// The underlying error, stringified.
        message: String,
    },
}
