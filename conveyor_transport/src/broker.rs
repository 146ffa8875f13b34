use crate::delivery::DeliveryLease;
use crate::envelope::{Envelope, EnvelopeError};
use crate::pool::PoolError;
use async_trait::async_trait;
use conveyor_codec::{Codec, CodecDescriptor, CodecError, CodecRegistry};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Represents a failure within a broker driver.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// The connection to the broker was lost; the consume loop aborts and
    /// the mediator is responsible for restarting it after the configured
    /// retry delay.
    #[error("broker '{broker}' lost its connection")]
    Disconnected {
        /// The name of the affected broker.
        broker: String,
    },

    /// The broker did not accept a published message.
    #[error("broker '{broker}' failed to publish to topic '{topic}': {message}")]
    PublishFailed {
        /// The name of the affected broker.
        broker: String,
        /// The topic of the failed publish.
        topic: String,
        /// The underlying error, stringified.
        message: String,
    },

    /// A second `consume` call was issued on a broker instance that is
    /// already consuming.
    #[error("broker '{broker}' is already consuming")]
    AlreadyConsuming {
        /// The name of the affected broker.
        broker: String,
    },

    /// A codec failure while serializing or parsing a message.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A structurally invalid envelope came off the wire.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// A connection pool failure.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// The transport headers that accompany a message on the wire, as far as the
/// codec layer is concerned.
///
/// Drivers store these differently (AMQP properties and headers, Kafka
/// headers), but every driver must carry the compression name so that the
/// receiving side can reconstruct the codec without sharing configuration
/// with the sender.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportHeaders {
    /// The content type of the serialized bytes, if the driver carried one.
    pub content_type: Option<String>,
    /// The compression name of the wire bytes, if the driver carried one.
    pub compression: Option<String>,
}

/// The fully encoded form of an outgoing envelope, together with the header
/// values the driver must attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WirePayload {
    /// The wire bytes: `compress(dumps(envelope_dict))`.
    pub bytes: Vec<u8>,
    /// The content type to attach.
    pub content_type: String,
    /// The compression name to attach.
    pub compression: String,
}

/// Describes a single consumer registration on a broker.
#[derive(Debug, Clone)]
pub struct ConsumerBinding {
    /// The topic to consume from.
    pub topic: String,
    /// The consumer tag presented to the broker.
    pub consumer_tag: String,
    /// The logical name of the consuming worker (doubles as the consumer
    /// group name on partitioned drivers).
    pub worker_name: String,
    /// How many unacknowledged deliveries the broker may have in flight.
    pub prefetch: u16,
    /// Cooperative stop signal for this consumer alone; the consume loop also
    /// observes the global [`RunContext`](conveyor_core::RunContext).
    pub halt: CancellationToken,
}

impl ConsumerBinding {
    /// Creates a binding for the given topic and worker with a fresh halt
    /// token and a prefetch of 1.
    pub fn new(topic: impl AsRef<str>, worker_name: impl AsRef<str>) -> Self {
        let topic = topic.as_ref().to_string();
        let worker_name = worker_name.as_ref().to_string();
        let consumer_tag = format!("{}:{}", worker_name, topic);

        Self {
            topic,
            consumer_tag,
            worker_name,
            prefetch: 1,
            halt: CancellationToken::new(),
        }
    }

    /// Re-creates this binding with the given prefetch.
    pub fn with_prefetch(self, prefetch: u16) -> Self {
        Self { prefetch, ..self }
    }

    /// Re-creates this binding with the given consumer tag.
    pub fn with_consumer_tag(self, consumer_tag: impl AsRef<str>) -> Self {
        Self {
            consumer_tag: consumer_tag.as_ref().to_string(),
            ..self
        }
    }
}

/// Receives incoming envelopes from a broker's consume loop, one at a time,
/// together with the [`DeliveryLease`] that must be used to finalize each
/// delivery.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    /// Handles a single incoming envelope.
    async fn handle(&self, envelope: Envelope, lease: DeliveryLease);
}

/// The uniform contract of a broker driver.
///
/// A broker instance is owned by exactly one consumer unit and one publisher
/// unit; it is never consumed from twice. Connection sharing across instances
/// that target the same endpoint happens below this contract, in the
/// [connection pool](crate::ConnectionPool).
#[async_trait]
pub trait Broker: Send + Sync {
    /// Reports the configured name of this broker.
    fn name(&self) -> &str;

    /// Opens the underlying connection. Idempotent.
    async fn connect(&self) -> Result<(), BrokerError>;

    /// Releases the underlying connection. Idempotent.
    async fn close(&self) -> Result<(), BrokerError>;

    /// Publishes the given envelope to the given topic, blocking until the
    /// broker has accepted the message.
    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(), BrokerError>;

    /// Registers a consumer per the given binding and delivers incoming
    /// envelopes to the given handler. Returns only when consumption stops —
    /// cooperatively (halt token, run context termination) or with an error.
    ///
    /// Calling this twice on the same broker instance fails with
    /// [`BrokerError::AlreadyConsuming`].
    async fn consume(
        &self,
        binding: ConsumerBinding,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(), BrokerError>;

    /// Encodes the given envelope into its wire form, with the header values
    /// this driver must attach. Lives on the broker because transport headers
    /// differ per driver.
    fn serialize(&self, envelope: &Envelope) -> Result<WirePayload, BrokerError>;

    /// Decodes incoming wire bytes into an envelope, preferring the codec
    /// named by the transport headers over this broker's own configuration.
    fn parse(&self, bytes: &[u8], headers: &TransportHeaders) -> Result<Envelope, BrokerError>;
}

/// The codec half of a broker driver: the broker's configured [`Codec`] plus
/// the [`CodecRegistry`] used to honor the codec named in incoming transport
/// headers.
///
/// Every driver composes one of these and delegates its `serialize`/`parse`
/// to it.
pub struct BrokerCodec {
    registry: Arc<CodecRegistry>,
    codec: Codec,
}

impl BrokerCodec {
    /// Resolves the given descriptor against the given registry.
    pub fn new(
        registry: Arc<CodecRegistry>,
        descriptor: &CodecDescriptor,
    ) -> Result<Self, CodecError> {
        let codec = registry.codec(descriptor)?;

        Ok(Self { registry, codec })
    }

    /// Exposes the configured codec.
    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    /// Encodes the given envelope with the configured codec.
    pub fn serialize(&self, envelope: &Envelope) -> Result<WirePayload, BrokerError> {
        let bytes = self.codec.encode(&envelope.to_dict())?;

        Ok(WirePayload {
            bytes,
            content_type: self.codec.content_type().to_string(),
            compression: self.codec.compression().to_string(),
        })
    }

    /// Decodes the given wire bytes, reconstructing the codec from the given
    /// transport headers where present and falling back to the configured
    /// codec where absent.
    pub fn parse(
        &self,
        bytes: &[u8],
        headers: &TransportHeaders,
    ) -> Result<Envelope, BrokerError> {
        let content_type = headers
            .content_type
            .as_deref()
            .unwrap_or_else(|| self.codec.content_type());
        let compression = headers
            .compression
            .as_deref()
            .unwrap_or_else(|| self.codec.compression());

        let codec = self.registry.resolve(content_type, compression)?;
        let dict = codec.decode(bytes)?;

        Ok(Envelope::from_dict(dict)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_codec::{COMPRESSION_GZIP, COMPRESSION_NONE, CONTENT_TYPE_JSON};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn gzip_codec() -> BrokerCodec {
        BrokerCodec::new(
            CodecRegistry::global(),
            &CodecDescriptor::new(CONTENT_TYPE_JSON, COMPRESSION_GZIP),
        )
        .unwrap()
    }

    #[test]
    fn serialize_attaches_header_values() {
        // Given
        let codec = gzip_codec();
        let envelope = Envelope::with_payload(json!({"n": 1})).build().unwrap();

        // When
        let wire = codec.serialize(&envelope).unwrap();

        // Then
        assert_eq!(wire.content_type, CONTENT_TYPE_JSON);
        assert_eq!(wire.compression, COMPRESSION_GZIP);
    }

    #[test]
    fn round_trip_preserves_the_envelope() {
        // Given
        let codec = gzip_codec();
        let envelope = Envelope::with_payload(json!({"n": 1}))
            .from_worker("source")
            .build()
            .unwrap();

        // When
        let wire = codec.serialize(&envelope).unwrap();
        let headers = TransportHeaders {
            content_type: Some(wire.content_type.clone()),
            compression: Some(wire.compression.clone()),
        };
        let restored = codec.parse(&wire.bytes, &headers).unwrap();

        // Then
        assert_eq!(restored, envelope);
    }

    #[test]
    fn parse_honors_the_header_compression_over_configuration() {
        // Given: a sender compressing with gzip
        let sender = gzip_codec();
        let envelope = Envelope::with_payload(json!({"n": 2})).build().unwrap();
        let wire = sender.serialize(&envelope).unwrap();

        // Given: a receiver configured without compression
        let receiver = BrokerCodec::new(
            CodecRegistry::global(),
            &CodecDescriptor::new(CONTENT_TYPE_JSON, COMPRESSION_NONE),
        )
        .unwrap();

        // When
        let headers = TransportHeaders {
            content_type: Some(wire.content_type.clone()),
            compression: Some(wire.compression.clone()),
        };
        let restored = receiver.parse(&wire.bytes, &headers).unwrap();

        // Then
        assert_eq!(restored, envelope);
    }
}
