use crate::broker::{Broker, BrokerCodec, BrokerError, ConsumerBinding, DeliveryHandler};
use crate::broker::{TransportHeaders, WirePayload};
use crate::delivery::{DeliveryLease, Finalizer};
use crate::envelope::Envelope;
use async_trait::async_trait;
use chrono::Utc;
use conveyor_core::RunContext;
use parking_lot::Mutex as SyncMutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::select;
use tokio::sync::Notify;
use tracing::debug;

/// The default per-topic queue capacity of a [`MemoryExchange`].
const DEFAULT_CAPACITY: usize = 1024;

/// The in-process message store behind one or more [`MemoryBroker`]
/// instances: a bounded, ordered FIFO per topic.
///
/// Cloning an exchange produces another handle onto the same store, which is
/// how separate broker instances (one per consumer unit) see each other's
/// messages. Not usable across processes.
#[derive(Clone)]
pub struct MemoryExchange {
    inner: Arc<MemoryExchangeInner>,
}

struct MemoryExchangeInner {
    queues: SyncMutex<HashMap<String, VecDeque<Envelope>>>,
    arrival: Notify,
    capacity: usize,
}

impl MemoryExchange {
    /// Creates an exchange with the default per-topic capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates an exchange with the given per-topic capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(MemoryExchangeInner {
                queues: SyncMutex::new(HashMap::new()),
                arrival: Notify::new(),
                capacity,
            }),
        }
    }

    /// Reports the number of envelopes currently enqueued on the given topic.
    pub fn depth(&self, topic: &str) -> usize {
        self.inner
            .queues
            .lock()
            .get(topic)
            .map(|queue| queue.len())
            .unwrap_or(0)
    }

    /// Appends the given envelope to the given topic's queue.
    fn push_back(&self, topic: &str, envelope: Envelope) -> Result<(), ()> {
        let mut queues = self.inner.queues.lock();
        let queue = queues.entry(topic.to_string()).or_default();

        if queue.len() >= self.inner.capacity {
            return Err(());
        }

        queue.push_back(envelope);
        drop(queues);

        self.inner.arrival.notify_waiters();

        Ok(())
    }

    /// Re-inserts the given envelope at the head of the given topic's queue.
    fn push_front(&self, topic: &str, envelope: Envelope) {
        self.inner
            .queues
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push_front(envelope);

        self.inner.arrival.notify_waiters();
    }

    /// Pops the next envelope off the given topic's queue, if any.
    fn pop(&self, topic: &str) -> Option<Envelope> {
        self.inner
            .queues
            .lock()
            .get_mut(topic)
            .and_then(|queue| queue.pop_front())
    }

    /// Waits for and pops the next envelope on the given topic.
    async fn next_on(&self, topic: &str) -> Envelope {
        loop {
            // Register for the wake-up before checking, to not miss arrivals
            let arrived = self.inner.arrival.notified();

            if let Some(envelope) = self.pop(topic) {
                return envelope;
            }

            arrived.await;
        }
    }
}

impl Default for MemoryExchange {
    fn default() -> Self {
        Self::new()
    }
}

/// The in-process broker driver: an ordered queue per topic, delivered
/// synchronously on the consuming task.
///
/// `ack` is a no-op; `reject` re-inserts the envelope at the head of its
/// queue. Intended for tests and single-process pipelines.
pub struct MemoryBroker {
    name: Arc<str>,
    codec: BrokerCodec,
    exchange: MemoryExchange,
    consuming: AtomicBool,
}

impl MemoryBroker {
    /// Creates a broker instance over the given exchange.
    pub fn new(name: impl AsRef<str>, codec: BrokerCodec, exchange: MemoryExchange) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            codec,
            exchange,
            consuming: AtomicBool::new(false),
        }
    }

    /// Exposes the underlying exchange of this broker instance.
    pub fn exchange(&self) -> &MemoryExchange {
        &self.exchange
    }
}

/// Finalizes a single in-memory delivery.
struct MemoryFinalizer {
    exchange: MemoryExchange,
    topic: String,
    envelope: Envelope,
}

#[async_trait]
impl Finalizer for MemoryFinalizer {
    async fn complete(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn requeue(&self) -> Result<(), BrokerError> {
        self.exchange
            .push_front(&self.topic, self.envelope.clone());

        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
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
        self.exchange
            .push_back(topic, envelope.clone())
            .map_err(|_| BrokerError::PublishFailed {
                broker: self.name.to_string(),
                topic: topic.to_string(),
                message: "topic queue is full".to_string(),
            })
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

        loop {
            let envelope = select! {
                biased;
                _ = RunContext::terminated() => break,
                _ = binding.halt.cancelled() => break,
                envelope = self.exchange.next_on(&binding.topic) => envelope,
            };

            if envelope.is_expired(Utc::now()) {
                debug!(
                    broker = self.name.as_ref(),
                    topic = binding.topic.as_str(),
                    envelope_id = %envelope.id(),
                    "Dropped an expired envelope",
                );

                continue;
            }

            let finalizer = Arc::new(MemoryFinalizer {
                exchange: self.exchange.clone(),
                topic: binding.topic.clone(),
                envelope: envelope.clone(),
            });
            let lease = DeliveryLease::new(&binding.consumer_tag, finalizer);

            handler.handle(envelope, lease).await;
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
