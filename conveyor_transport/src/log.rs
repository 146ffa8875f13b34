use crate::broker::{Broker, BrokerCodec, BrokerError, ConsumerBinding, DeliveryHandler};
use crate::broker::{TransportHeaders, WirePayload};
use crate::envelope::Envelope;
use async_trait::async_trait;
use conveyor_core::RunContext;
use std::sync::Arc;
use tokio::select;
use tracing::info;

/// The emit-only broker driver: every publish is logged instead of
/// transported, and nothing is ever delivered.
///
/// Useful for wiring workers whose output is interesting only as a log trail,
/// and as a stand-in broker in development configurations.
pub struct LogBroker {
    name: Arc<str>,
    codec: BrokerCodec,
}

impl LogBroker {
    /// Creates a log broker with the given name.
    pub fn new(name: impl AsRef<str>, codec: BrokerCodec) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            codec,
        }
    }
}

#[async_trait]
impl Broker for LogBroker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(), BrokerError> {
        let wire = self.serialize(envelope)?;

        info!(
            broker = self.name.as_ref(),
            topic,
            envelope_id = %envelope.id(),
            content_type = wire.content_type.as_str(),
            compression = wire.compression.as_str(),
            byte_count = wire.bytes.len(),
            payload = %envelope.payload(),
            "Published an envelope to the log",
        );

        Ok(())
    }

    async fn consume(
        &self,
        binding: ConsumerBinding,
        _handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(), BrokerError> {
        // Nothing is ever delivered; park until consumption is stopped
        select! {
            biased;
            _ = RunContext::terminated() => {}
            _ = binding.halt.cancelled() => {}
        }

        Ok(())
    }

    fn serialize(&self, envelope: &Envelope) -> Result<WirePayload, BrokerError> {
        self.codec.serialize(envelope)
    }

    fn parse(&self, bytes: &[u8], headers: &TransportHeaders) -> Result<Envelope, BrokerError> {
        self.codec.parse(bytes, headers)
    }
}
