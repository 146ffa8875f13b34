use crate::{AmqpProps, AmqpTarget};
use async_trait::async_trait;
use chrono::Utc;
use conveyor_core::RunContext;
use conveyor_transport::{
    Broker, BrokerCodec, BrokerError, ConsumerBinding, DeliveryHandler, DeliveryLease, Finalizer,
    HEADER_COMPRESSION, PoolManager, TransportHeaders, WirePayload,
};
use conveyor_transport::{ConnectionPool, Envelope};
use futures::StreamExt;
use lapin::BasicProperties;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{Channel, Result as LapinResult};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::select;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, warn};

/// The AMQP broker driver.
///
/// One instance serves exactly one consumer unit and one publisher unit. The
/// underlying connection is shared with other instances through the
/// [`ConnectionPool`]; on top of it, this instance lazily opens two channels
/// of its own — one for consuming, one for publishing — and re-opens them
/// (re-issuing all topology declarations) whenever they go bad.
pub struct AmqpBroker {
    name: Arc<str>,
    codec: BrokerCodec,
    props: AmqpProps,
    manager: PoolManager<AmqpTarget>,
    write: AsyncMutex<WriteChannel>,
    consuming: AtomicBool,
}

/// The publisher-side channel together with the set of topics already
/// declared on it. The set empties whenever the channel is replaced, which is
/// what re-executes the declarations after a reconnection.
struct WriteChannel {
    channel: Option<Channel>,
    declared: HashSet<String>,
}

impl AmqpBroker {
    /// Creates a broker instance over the given pool manager.
    pub fn new(
        name: impl AsRef<str>,
        codec: BrokerCodec,
        props: AmqpProps,
        manager: PoolManager<AmqpTarget>,
    ) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            codec,
            props,
            manager,
            write: AsyncMutex::new(WriteChannel {
                channel: None,
                declared: HashSet::new(),
            }),
            consuming: AtomicBool::new(false),
        }
    }

    /// Creates a broker instance for its configured endpoint on the given
    /// pool.
    pub fn pooled(
        name: impl AsRef<str>,
        codec: BrokerCodec,
        props: AmqpProps,
        pool: &Arc<ConnectionPool<AmqpTarget>>,
    ) -> Self {
        let manager = pool.manager(props.target());

        Self::new(name, codec, props, manager)
    }

    /// Shorthand for a [`BrokerError::Disconnected`] attributed to this
    /// broker.
    fn disconnected(&self) -> BrokerError {
        BrokerError::Disconnected {
            broker: self.name.to_string(),
        }
    }
}

impl AmqpBroker {
    /// Opens a fresh channel on the pooled connection.
    async fn open_channel(&self) -> Result<Channel, BrokerError> {
        let connection = self.manager.connect().await?;

        connection.create_channel().await.map_err(|error| {
            warn!(
                broker = self.name.as_ref(),
                ?error,
                error_message = %error,
                "Failed to create an AMQP channel",
            );

            self.disconnected()
        })
    }

    /// Declares the exchange, the queue for the given topic, and the binding
    /// between them. Declarations are idempotent and are re-executed on every
    /// fresh channel.
    async fn declare_topic(&self, channel: &Channel, topic: &str) -> LapinResult<()> {
        channel
            .exchange_declare(
                &self.props.exchange_name,
                self.props.exchange_kind(),
                ExchangeDeclareOptions {
                    passive: self.props.passive,
                    durable: self.props.durable,
                    auto_delete: self.props.auto_delete,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await?;

        channel
            .queue_declare(
                topic,
                QueueDeclareOptions {
                    passive: false,
                    durable: self.props.durable,
                    exclusive: false,
                    auto_delete: self.props.auto_delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await?;

        channel
            .queue_bind(
                topic,
                &self.props.exchange_name,
                topic, // routing key = topic
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await?;

        Ok(())
    }

    /// Composes the message properties for publishing the given envelope.
    fn compose_properties(&self, envelope: &Envelope, wire: &WirePayload) -> BasicProperties {
        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from(HEADER_COMPRESSION),
            AMQPValue::LongString(LongString::from(wire.compression.clone())),
        );

        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(wire.content_type.clone()))
            .with_content_encoding(ShortString::from("utf-8"))
            .with_message_id(ShortString::from(envelope.id().to_string()))
            .with_headers(headers);

        if self.props.is_persistent {
            properties = properties.with_delivery_mode(2);
        }

        if let Some(answer_id) = envelope.answer_id() {
            properties = properties.with_correlation_id(ShortString::from(answer_id.to_string()));
        }

        if let Some(answer_to_topic) = envelope.answer_to_topic() {
            properties = properties.with_reply_to(ShortString::from(answer_to_topic.to_string()));
        }

        if let Some(ttl_s) = envelope.ttl_s() {
            // AMQP per-message expiration is in milliseconds
            properties =
                properties.with_expiration(ShortString::from((ttl_s * 1000).to_string()));
        }

        properties
    }

    /// Extracts the codec-relevant transport headers from the properties of
    /// an incoming delivery.
    fn transport_headers(properties: &BasicProperties) -> TransportHeaders {
        let content_type = properties
            .content_type()
            .as_ref()
            .map(|value| value.as_str().to_string());

        let compression = properties
            .headers()
            .as_ref()
            .and_then(|table| table.inner().get(HEADER_COMPRESSION))
            .and_then(|value| match value {
                AMQPValue::LongString(value) => {
                    Some(String::from_utf8_lossy(value.as_bytes()).into_owned())
                }
                AMQPValue::ShortString(value) => Some(value.as_str().to_string()),
                _ => None,
            });

        TransportHeaders {
            content_type,
            compression,
        }
    }
}

/// Finalizes a single AMQP delivery through its acker.
struct AmqpFinalizer {
    broker: Arc<str>,
    acker: Acker,
}

#[async_trait]
impl Finalizer for AmqpFinalizer {
    async fn complete(&self) -> Result<(), BrokerError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|_| BrokerError::Disconnected {
                broker: self.broker.to_string(),
            })
    }

    async fn requeue(&self) -> Result<(), BrokerError> {
        self.acker
            .reject(BasicRejectOptions { requeue: true })
            .await
            .map_err(|_| BrokerError::Disconnected {
                broker: self.broker.to_string(),
            })
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<(), BrokerError> {
        self.manager.connect().await?;

        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        // Drop the publisher channel along with its declarations
        let mut write = self.write.lock().await;
        write.channel = None;
        write.declared.clear();
        drop(write);

        self.manager.close().await;

        Ok(())
    }

    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(), BrokerError> {
        let wire = self.serialize(envelope)?;
        let properties = self.compose_properties(envelope, &wire);

        let mut write = self.write.lock().await;

        // Lazily open the publisher channel
        let channel = match write.channel.clone() {
            Some(channel) => channel,
            None => {
                let channel = self.open_channel().await?;
                write.channel = Some(channel.clone());
                write.declared.clear();

                channel
            }
        };

        // Re-issue declarations once per topic per channel
        if !write.declared.contains(topic) {
            if let Err(error) = self.declare_topic(&channel, topic).await {
                write.channel = None;

                return Err(BrokerError::PublishFailed {
                    broker: self.name.to_string(),
                    topic: topic.to_string(),
                    message: error.to_string(),
                });
            }

            write.declared.insert(topic.to_string());
        }

        let transmission = channel
            .basic_publish(
                &self.props.exchange_name,
                topic, // routing key = topic
                BasicPublishOptions::default(),
                &wire.bytes,
                properties,
            )
            .await;

        let confirm = match transmission {
            Ok(confirm) => confirm,
            Err(error) => {
                // The channel is suspect; replace it on the next publish
                write.channel = None;

                return Err(BrokerError::PublishFailed {
                    broker: self.name.to_string(),
                    topic: topic.to_string(),
                    message: error.to_string(),
                });
            }
        };

        drop(write);

        // Resolves immediately unless publisher confirms were selected
        confirm.await.map_err(|error| BrokerError::PublishFailed {
            broker: self.name.to_string(),
            topic: topic.to_string(),
            message: error.to_string(),
        })?;

        Ok(())
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

        // Open the consumer channel and set the topology up
        let channel = self.open_channel().await?;

        channel
            .basic_qos(binding.prefetch, BasicQosOptions { global: false })
            .await
            .map_err(|_| self.disconnected())?;

        self.declare_topic(&channel, &binding.topic)
            .await
            .map_err(|_| self.disconnected())?;

        let mut consumer = channel
            .basic_consume(
                &binding.topic,
                &binding.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|_| self.disconnected())?;

        // Blocking deliver loop
        loop {
            let next = select! {
                biased;
                _ = RunContext::terminated() => return Ok(()),
                _ = binding.halt.cancelled() => return Ok(()),
                next = consumer.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(error)) => {
                    warn!(
                        alert = true,
                        broker = self.name.as_ref(),
                        topic = binding.topic.as_str(),
                        ?error,
                        error_message = %error,
                        "Received an error from an AMQP consumer",
                    );

                    return Err(self.disconnected());
                }
                None => {
                    debug!(
                        broker = self.name.as_ref(),
                        topic = binding.topic.as_str(),
                        "AMQP consumer ran out of deliveries",
                    );

                    return Err(self.disconnected());
                }
            };

            let headers = Self::transport_headers(&delivery.properties);

            let envelope = match self.parse(&delivery.data, &headers) {
                Ok(envelope) => envelope,
                Err(error) => {
                    error!(
                        alert = true,
                        broker = self.name.as_ref(),
                        topic = binding.topic.as_str(),
                        ?error,
                        error_message = %error,
                        byte_preview = String::from_utf8_lossy(&delivery.data).as_ref(),
                        "Failed to decode an incoming AMQP message",
                    );

                    // Undecodable bytes must not recycle
                    let _ = delivery
                        .acker
                        .reject(BasicRejectOptions { requeue: false })
                        .await;

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

                let _ = delivery.acker.ack(BasicAckOptions { multiple: false }).await;

                continue;
            }

            let finalizer = Arc::new(AmqpFinalizer {
                broker: Arc::clone(&self.name),
                acker: delivery.acker,
            });
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
    use conveyor_codec::{
        COMPRESSION_GZIP, CONTENT_TYPE_JSON, CodecDescriptor, CodecRegistry, GzipCompressor,
        Compressor,
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn make_broker() -> AmqpBroker {
        let codec = BrokerCodec::new(
            CodecRegistry::global(),
            &CodecDescriptor::new(CONTENT_TYPE_JSON, COMPRESSION_GZIP),
        )
        .unwrap();
        let pool = ConnectionPool::new();

        AmqpBroker::pooled("main", codec, AmqpProps::default(), &pool)
    }

    #[test]
    fn persistent_publish_carries_the_wire_contract() {
        // Given
        let broker = make_broker();
        let envelope = Envelope::with_payload(json!({"n": 1})).build().unwrap();

        // When
        let wire = broker.serialize(&envelope).unwrap();
        let properties = broker.compose_properties(&envelope, &wire);

        // Then: delivery_mode=2, content type, encoding, compression header
        assert_eq!(properties.delivery_mode(), &Some(2));
        assert_eq!(
            properties.content_type().as_ref().map(|value| value.as_str()),
            Some(CONTENT_TYPE_JSON),
        );
        assert_eq!(
            properties
                .content_encoding()
                .as_ref()
                .map(|value| value.as_str()),
            Some("utf-8"),
        );
        let headers = AmqpBroker::transport_headers(&properties);
        assert_eq!(headers.compression.as_deref(), Some(COMPRESSION_GZIP));

        // Then: body bytes = gzip(json(envelope_dict))
        let decompressed = GzipCompressor.decompress(&wire.bytes).unwrap();
        let dict: serde_json::Value = serde_json::from_slice(&decompressed).unwrap();
        assert_eq!(dict["payload"], json!({"n": 1}));
    }

    #[test]
    fn transient_broker_omits_the_delivery_mode() {
        // Given
        let codec = BrokerCodec::new(CodecRegistry::global(), &CodecDescriptor::default()).unwrap();
        let pool = ConnectionPool::new();
        let props = AmqpProps {
            is_persistent: false,
            ..AmqpProps::default()
        };
        let broker = AmqpBroker::pooled("main", codec, props, &pool);
        let envelope = Envelope::with_payload(json!({"n": 1})).build().unwrap();

        // When
        let wire = broker.serialize(&envelope).unwrap();
        let properties = broker.compose_properties(&envelope, &wire);

        // Then
        assert_eq!(properties.delivery_mode(), &None);
    }

    #[test]
    fn answer_coordinates_ride_the_native_properties() {
        // Given
        let broker = make_broker();
        let answer_id = uuid::Uuid::new_v4();
        let envelope = Envelope::with_payload(json!({"x": 2}))
            .answered_at("caller__answer", answer_id)
            .need_answer()
            .build()
            .unwrap();

        // When
        let wire = broker.serialize(&envelope).unwrap();
        let properties = broker.compose_properties(&envelope, &wire);

        // Then
        assert_eq!(
            properties
                .correlation_id()
                .as_ref()
                .map(|value| value.as_str()),
            Some(answer_id.to_string().as_str()),
        );
        assert_eq!(
            properties.reply_to().as_ref().map(|value| value.as_str()),
            Some("caller__answer"),
        );
    }

    #[test]
    fn ttl_maps_to_expiration_in_milliseconds() {
        // Given
        let broker = make_broker();
        let envelope = Envelope::with_payload(json!({"n": 1}))
            .expiring_after_s(30)
            .build()
            .unwrap();

        // When
        let wire = broker.serialize(&envelope).unwrap();
        let properties = broker.compose_properties(&envelope, &wire);

        // Then
        assert_eq!(
            properties.expiration().as_ref().map(|value| value.as_str()),
            Some("30000"),
        );
    }

    #[test]
    fn transport_headers_survive_the_property_round_trip() {
        // Given
        let broker = make_broker();
        let envelope = Envelope::with_payload(json!({"n": 1})).build().unwrap();
        let wire = broker.serialize(&envelope).unwrap();
        let properties = broker.compose_properties(&envelope, &wire);

        // When
        let headers = AmqpBroker::transport_headers(&properties);

        // Then
        assert_eq!(headers.content_type.as_deref(), Some(CONTENT_TYPE_JSON));
        assert_eq!(headers.compression.as_deref(), Some(COMPRESSION_GZIP));

        // Then: the bytes decode back into the original envelope
        let restored = broker.parse(&wire.bytes, &headers).unwrap();
        assert_eq!(restored, envelope);
    }
}
