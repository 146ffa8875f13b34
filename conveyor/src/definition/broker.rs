use conveyor_codec::CodecDescriptor;
use serde::Deserialize;
use serde_json::Value;

/// Declares one broker: a named transport with a codec, a retry delay, and
/// free-form driver-specific properties.
///
/// The `dynamic_props` ride along untouched until the driver deserializes
/// them against its own schema (`AmqpProps`, `KafkaProps`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BrokerDefinition {
    /// The unique name of this broker.
    pub name: String,
    /// The driver implementing this broker.
    pub driver: BrokerDriver,
    /// The codec used to put envelopes on the wire.
    #[serde(default)]
    pub codec: CodecDescriptor,
    /// How long to wait before restarting an aborted consumer, in seconds.
    #[serde(default = "default_retry_delay_s")]
    pub retry_delay_s: u64,
    /// Driver-specific properties, validated by the driver itself.
    #[serde(default)]
    pub dynamic_props: Value,
}

/// The driver behind a [`BrokerDefinition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerDriver {
    /// The AMQP driver (`amqp` feature).
    Amqp,
    /// The Kafka driver (`kafka` feature).
    Kafka,
    /// The in-process memory driver.
    Memory,
    /// The emit-only log driver.
    Log,
}

fn default_retry_delay_s() -> u64 {
    3
}
