use crate::error::CodecError;
use crate::{CONTENT_TYPE_JSON, CONTENT_TYPE_MSGPACK};
use serde_json::Value;

/// Represents a way of mapping an envelope dictionary (a JSON-like value
/// tree) to a sequence of bytes and back.
///
/// A serializer is registered under its [content type](Serializer::content_type)
/// and is expected to be pure: `loads(dumps(value))` must reproduce `value`
/// for any value tree that the pipeline produces.
pub trait Serializer: Send + Sync {
    /// Reports the content type under which this serializer is known.
    fn content_type(&self) -> &'static str;

    /// Turns the given envelope dictionary into bytes.
    fn dumps(&self, value: &Value) -> Result<Vec<u8>, CodecError>;

    /// Turns the given bytes back into an envelope dictionary.
    fn loads(&self, bytes: &[u8]) -> Result<Value, CodecError>;
}

/// The built-in serializer for `application/json`.
#[derive(Debug, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn content_type(&self) -> &'static str {
        CONTENT_TYPE_JSON
    }

    fn dumps(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|error| CodecError::Serialize {
            content_type: self.content_type().to_string(),
            message: error.to_string(),
        })
    }

    fn loads(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        serde_json::from_slice(bytes).map_err(|error| CodecError::Deserialize {
            content_type: self.content_type().to_string(),
            message: error.to_string(),
        })
    }
}

/// The built-in serializer for `application/msgpack`.
///
/// Maps are encoded with string keys (the named representation), so that the
/// bytes remain self-describing and interoperable with non-Rust consumers.
#[derive(Debug, Default)]
pub struct MsgpackSerializer;

impl Serializer for MsgpackSerializer {
    fn content_type(&self) -> &'static str {
        CONTENT_TYPE_MSGPACK
    }

    fn dumps(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        rmp_serde::to_vec_named(value).map_err(|error| CodecError::Serialize {
            content_type: self.content_type().to_string(),
            message: error.to_string(),
        })
    }

    fn loads(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        rmp_serde::from_slice(bytes).map_err(|error| CodecError::Deserialize {
            content_type: self.content_type().to_string(),
            message: error.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn json_round_trip() {
        // Given
        let serializer = JsonSerializer;
        let value = json!({"value": "hi", "n": 1});

        // When
        let bytes = serializer.dumps(&value).unwrap();
        let restored = serializer.loads(&bytes).unwrap();

        // Then
        assert_eq!(restored, value);
    }

    #[test]
    fn msgpack_round_trip() {
        // Given
        let serializer = MsgpackSerializer;
        let value = json!({"value": "hi", "nested": {"n": [1, 2, 3]}});

        // When
        let bytes = serializer.dumps(&value).unwrap();
        let restored = serializer.loads(&bytes).unwrap();

        // Then
        assert_eq!(restored, value);
    }

    #[test]
    fn json_rejects_gibberish() {
        // Given
        let serializer = JsonSerializer;

        // When
        let result = serializer.loads(b"{not json");

        // Then
        assert!(matches!(result, Err(CodecError::Deserialize { .. })));
    }
}
