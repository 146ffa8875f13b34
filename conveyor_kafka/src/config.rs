use serde::Deserialize;
use serde_json::Value;

/// The driver-specific configuration of a [`KafkaBroker`](crate::KafkaBroker),
/// deserialized from the `dynamic_props` of a broker definition.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct KafkaProps {
    /// The comma-separated bootstrap server list.
    pub bootstrap_servers: String,
    /// Where a fresh consumer group starts reading (`earliest` or `latest`).
    pub auto_offset_reset: String,
    /// The consumer session timeout, in milliseconds.
    pub session_timeout_ms: u64,
    /// The producer-side delivery timeout, in milliseconds.
    pub message_timeout_ms: u64,
}

impl Default for KafkaProps {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            // Fresh groups must not skip the backlog
            auto_offset_reset: "earliest".to_string(),
            session_timeout_ms: 6000,
            message_timeout_ms: 30000,
        }
    }
}

impl KafkaProps {
    /// Deserializes the given `dynamic_props` value, filling absent fields
    /// with the defaults. A `null` value yields the full defaults.
    pub fn from_dynamic(dynamic_props: &Value) -> Result<Self, serde_json::Error> {
        if dynamic_props.is_null() {
            return Ok(Self::default());
        }

        serde_json::from_value(dynamic_props.clone())
    }
}
