use crate::{KafkaProps, KafkaTarget};
use async_trait::async_trait;
use chrono::Utc;
use conveyor_core::RunContext;
use conveyor_transport::{
    Broker, BrokerCodec, BrokerError, ConsumerBinding, DeliveryHandler, DeliveryLease, Finalizer,
    HEADER_COMPRESSION, HEADER_CONTENT_TYPE, PoolManager, TransportHeaders, WirePayload,
};
use conveyor_transport::{ConnectionPool, Envelope};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::FutureRecord;
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::select;
use tracing::{debug, error, warn};

/// How long a seek or commit may take before the finalizer gives up.
const FINALIZE_TIMEOUT: Duration = Duration::from_secs(5);

/// The Kafka broker driver.
///
/// Publishing goes through a pooled producer shared with every other
/// instance on the same bootstrap set; each publish is keyed by the
/// envelope's `worker_creator` (or id) for per-partition ordering. Consuming
/// creates a dedicated group member under the consuming worker's name, with
/// auto-commit disabled: the offset of a delivery is committed by `ack` and
/// rewound by `reject`.
pub struct KafkaBroker {
    name: Arc<str>,
    codec: BrokerCodec,
    props: KafkaProps,
    manager: PoolManager<KafkaTarget>,
    consuming: AtomicBool,
}

impl KafkaBroker {
    /// Creates a broker instance over the given pool manager.
    pub fn new(
        name: impl AsRef<str>,
        codec: BrokerCodec,
        props: KafkaProps,
        manager: PoolManager<KafkaTarget>,
    ) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            codec,
            props,
            manager,
            consuming: AtomicBool::new(false),
        }
    }

    /// Creates a broker instance for its configured bootstrap set on the
    /// given pool.
    pub fn pooled(
        name: impl AsRef<str>,
        codec: BrokerCodec,
        props: KafkaProps,
        pool: &Arc<ConnectionPool<KafkaTarget>>,
    ) -> Self {
        let target = KafkaTarget::new(&props.bootstrap_servers, props.message_timeout_ms);
        let manager = pool.manager(target);

        Self::new(name, codec, props, manager)
    }

    /// Shorthand for a [`BrokerError::Disconnected`] attributed to this
    /// broker.
    fn disconnected(&self) -> BrokerError {
        BrokerError::Disconnected {
            broker: self.name.to_string(),
        }
    }

    /// Builds the dedicated group member for the given binding.
    ///
    /// The consumer group is named after the consuming worker; the prefetch
    /// maps onto the client's fetch batch size.
    fn build_consumer(&self, binding: &ConsumerBinding) -> Result<StreamConsumer, BrokerError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.props.bootstrap_servers)
            .set("group.id", &binding.worker_name)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.props.auto_offset_reset)
            .set("session.timeout.ms", self.props.session_timeout_ms.to_string())
            .set("queued.min.messages", binding.prefetch.max(1).to_string())
            .create()
            .map_err(|error| {
                warn!(
                    broker = self.name.as_ref(),
                    ?error,
                    error_message = %error,
                    "Failed to create a Kafka consumer",
                );

                self.disconnected()
            })?;

        consumer
            .subscribe(&[binding.topic.as_str()])
            .map_err(|_| self.disconnected())?;

        Ok(consumer)
    }

    /// Extracts the codec-relevant transport headers from an incoming
    /// message.
    fn transport_headers(message: &impl Message) -> TransportHeaders {
        let mut headers = TransportHeaders::default();

        let Some(message_headers) = message.headers() else {
            return headers;
        };

        for header in message_headers.iter() {
            let value = header
                .value
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned());

            match header.key {
                HEADER_CONTENT_TYPE => headers.content_type = value,
                HEADER_COMPRESSION => headers.compression = value,
                _ => {}
            }
        }

        headers
    }
}

/// Finalizes a single Kafka delivery by committing or rewinding its offset.
struct KafkaFinalizer {
    broker: Arc<str>,
    consumer: Arc<StreamConsumer>,
    topic: String,
    partition: i32,
    offset: i64,
}

#[async_trait]
impl Finalizer for KafkaFinalizer {
    async fn complete(&self) -> Result<(), BrokerError> {
        let mut offsets = TopicPartitionList::new();

        offsets
            .add_partition_offset(&self.topic, self.partition, Offset::Offset(self.offset + 1))
            .and_then(|_| self.consumer.commit(&offsets, CommitMode::Sync))
            .map_err(|error| {
                warn!(
                    broker = self.broker.as_ref(),
                    topic = self.topic.as_str(),
                    partition = self.partition,
                    offset = self.offset,
                    ?error,
                    error_message = %error,
                    "Failed to commit a Kafka offset",
                );

                BrokerError::Disconnected {
                    broker: self.broker.to_string(),
                }
            })
    }

    async fn requeue(&self) -> Result<(), BrokerError> {
        // Rewinding to the uncommitted offset makes the next poll redeliver
        self.consumer
            .seek(
                &self.topic,
                self.partition,
                Offset::Offset(self.offset),
                Timeout::After(FINALIZE_TIMEOUT),
            )
            .map_err(|error| {
                warn!(
                    broker = self.broker.as_ref(),
                    topic = self.topic.as_str(),
                    partition = self.partition,
                    offset = self.offset,
                    ?error,
                    error_message = %error,
                    "Failed to rewind a Kafka partition",
                );

                BrokerError::Disconnected {
                    broker: self.broker.to_string(),
                }
            })
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<(), BrokerError> {
        self.manager.connect().await?;

        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.manager.close().await;

        Ok(())
    }

    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(), BrokerError> {
        let wire = self.serialize(envelope)?;
        let producer = self.manager.connect().await?;

        // Default the partition key to the producing worker for ordering
        let key = envelope
            .worker_creator()
            .map(str::to_string)
            .unwrap_or_else(|| envelope.id().to_string());

        let headers = OwnedHeaders::new()
            .insert(Header {
                key: HEADER_CONTENT_TYPE,
                value: Some(&wire.content_type),
            })
            .insert(Header {
                key: HEADER_COMPRESSION,
                value: Some(&wire.compression),
            });

        let record = FutureRecord::to(topic)
            .payload(&wire.bytes)
            .key(&key)
            .headers(headers);

        let delivery = producer
            .send(
                record,
                Timeout::After(Duration::from_millis(self.props.message_timeout_ms)),
            )
            .await;

        match delivery {
            Ok(_) => Ok(()),
            Err((error, _record)) => Err(BrokerError::PublishFailed {
                broker: self.name.to_string(),
                topic: topic.to_string(),
                message: error.to_string(),
            }),
        }
    }

    async fn consume(
        &self,
        binding: ConsumerBinding,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(), BrokerError> {
        if self.consuming.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::AlreadyConsuming {
                broker: self.name.to_string(),
            });
        }

        let consumer = Arc::new(self.build_consumer(&binding)?);

        loop {
            let received = select! {
                biased;
                _ = RunContext::terminated() => return Ok(()),
                _ = binding.halt.cancelled() => return Ok(()),
                received = consumer.recv() => received,
            };

            let message = match received {
                Ok(message) => message,
                Err(error) => {
                    warn!(
                        alert = true,
                        broker = self.name.as_ref(),
                        topic = binding.topic.as_str(),
                        ?error,
                        error_message = %error,
                        "Received an error from a Kafka consumer",
                    );

                    return Err(self.disconnected());
                }
            };

            let headers = Self::transport_headers(&message);
            let bytes = message.payload().unwrap_or_default();

            let finalizer = Arc::new(KafkaFinalizer {
                broker: Arc::clone(&self.name),
                consumer: Arc::clone(&consumer),
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
            });

            let envelope = match self.parse(bytes, &headers) {
                Ok(envelope) => envelope,
                Err(error) => {
                    error!(
                        alert = true,
                        broker = self.name.as_ref(),
                        topic = binding.topic.as_str(),
                        ?error,
                        error_message = %error,
                        byte_preview = String::from_utf8_lossy(bytes).as_ref(),
                        "Failed to decode an incoming Kafka message",
                    );

                    // Undecodable bytes must not recycle: commit past them
                    let _ = finalizer.complete().await;

                    continue;
                }
            };

            if envelope.is_expired(Utc::now()) {
                debug!(
                    broker = self.name.as_ref(),
                    topic = binding.topic.as_str(),
                    envelope_id = %envelope.id(),
                    "Dropped an expired envelope",
                );

                let _ = finalizer.complete().await;

                continue;
            }

            let lease = DeliveryLease::new(&binding.consumer_tag, finalizer);

            handler.handle(envelope, lease).await;
        }
    }

    fn serialize(&self, envelope: &Envelope) -> Result<WirePayload, BrokerError> {
        self.codec.serialize(envelope)
    }

    fn parse(&self, bytes: &[u8], headers: &TransportHeaders) -> Result<Envelope, BrokerError> {
        self.codec.parse(bytes, headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_codec::{CONTENT_TYPE_MSGPACK, COMPRESSION_NONE, CodecDescriptor, CodecRegistry};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn make_broker() -> KafkaBroker {
        let codec = BrokerCodec::new(
            CodecRegistry::global(),
            &CodecDescriptor::new(CONTENT_TYPE_MSGPACK, COMPRESSION_NONE),
        )
        .unwrap();
        let pool = ConnectionPool::new();

        KafkaBroker::pooled("events", codec, KafkaProps::default(), &pool)
    }

    #[test]
    fn serialize_round_trips_through_the_wire_contract() {
        // Given
        let broker = make_broker();
        let envelope = Envelope::with_payload(json!({"n": 1}))
            .from_worker("source")
            .build()
            .unwrap();

        // When
        let wire = broker.serialize(&envelope).unwrap();
        let headers = TransportHeaders {
            content_type: Some(wire.content_type.clone()),
            compression: Some(wire.compression.clone()),
        };
        let restored = broker.parse(&wire.bytes, &headers).unwrap();

        // Then
        assert_eq!(restored, envelope);
        assert_eq!(wire.content_type, CONTENT_TYPE_MSGPACK);
    }
}
