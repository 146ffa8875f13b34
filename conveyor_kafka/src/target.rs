use async_trait::async_trait;
use conveyor_transport::{Connectable, PoolError};
use rdkafka::ClientConfig;
use rdkafka::producer::{FutureProducer, Producer};
use rdkafka::util::Timeout;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Describes one Kafka bootstrap set as a poolable connection target.
///
/// The pooled object is the producer client: producers are safe to share
/// across every broker instance that publishes to the same cluster.
/// Consumers, on the other hand, are one-per-group-member and are created
/// outside the pool, by each consuming broker instance itself.
#[derive(Clone)]
pub struct KafkaTarget {
    bootstrap_servers: Arc<str>,
    message_timeout_ms: u64,
    key: u64,
}

impl KafkaTarget {
    /// Creates a target for the given bootstrap set.
    pub fn new(bootstrap_servers: impl AsRef<str>, message_timeout_ms: u64) -> Self {
        let bootstrap_servers: Arc<str> = Arc::from(bootstrap_servers.as_ref());

        let mut hasher = DefaultHasher::new();
        bootstrap_servers.hash(&mut hasher);
        let key = hasher.finish();

        Self {
            bootstrap_servers,
            message_timeout_ms,
            key,
        }
    }
}

#[async_trait]
impl Connectable for KafkaTarget {
    type Connection = FutureProducer;

    fn key(&self) -> u64 {
        self.key
    }

    fn identifier(&self) -> String {
        format!("kafka://{}", self.bootstrap_servers)
    }

    async fn open(&self) -> Result<FutureProducer, PoolError> {
        ClientConfig::new()
            .set("bootstrap.servers", self.bootstrap_servers.as_ref())
            .set("message.timeout.ms", self.message_timeout_ms.to_string())
            .create()
            .map_err(|error| PoolError::new(self.identifier(), error.to_string()))
    }

    async fn close(&self, producer: &FutureProducer) {
        // Push out whatever is still buffered before the client drops
        let result = producer.flush(Timeout::After(Duration::from_secs(5)));

        match result {
            Ok(()) => info!(
                identifier = self.identifier(),
                "Flushed and released a Kafka producer",
            ),
            Err(error) => warn!(
                identifier = self.identifier(),
                ?error,
                error_message = %error,
                "Failed to flush a Kafka producer before release",
            ),
        }
    }

    fn is_closed(&self, _producer: &FutureProducer) -> bool {
        // The client reconnects internally; a created producer never goes bad
        false
    }
}
