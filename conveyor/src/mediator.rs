use crate::definition::broker::{BrokerDefinition, BrokerDriver};
use crate::error::MediatorError;
use crate::pending::PendingAnswers;
use crate::registry::DefinitionRegistry;
use crate::worker::{Worker, WorkerRunner};
use async_trait::async_trait;
use conveyor_codec::CodecRegistry;
use conveyor_core::{Backoff, BackoffConfig, RunContext, Spindown};
use conveyor_transport::{
    Broker, BrokerCodec, ConsumerBinding, DeliveryHandler, DeliveryLease, Envelope, FaultTopic,
    LogBroker, MemoryBroker, MemoryExchange,
};
use parking_lot::Mutex as SyncMutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// The topic that error envelopes are routed to when nothing else claims
/// them.
const DEFAULT_ERROR_TOPIC: &str = "__error__";

/// The central object of the pipeline: owns the validated definitions,
/// routes publishes by logical worker name, correlates answers to blocked
/// callers, and hands out consumers for worker input topics.
///
/// A mediator is cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Mediator {
    inner: Arc<MediatorInner>,
}

struct MediatorInner {
    registry: DefinitionRegistry,
    codec_registry: Arc<CodecRegistry>,
    publishers: HashMap<String, Arc<dyn Broker>>,
    answer_routes: HashMap<String, String>,
    pending: PendingAnswers,
    alone: AloneGuard,
    memory_exchange: MemoryExchange,
    error_topic: String,
}

/// The optional knobs of a [send](Mediator::send_with), built iteratively.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    alone: bool,
    from_worker: Option<String>,
    parent_id: Option<Uuid>,
    ttl_s: Option<u64>,
    answer: Option<(String, Uuid)>,
    need_answer: bool,
}

impl SendOptions {
    /// Creates the default options: a plain fire-and-forget send.
    pub fn new() -> Self {
        Self::default()
    }

    /// Suppresses this send while a previous identical message to the same
    /// worker is still enqueued.
    pub fn alone(mut self) -> Self {
        self.alone = true;

        self
    }

    /// Records the logical name of the worker emitting this message.
    pub fn from_worker(mut self, worker: impl AsRef<str>) -> Self {
        self.from_worker = Some(worker.as_ref().to_string());

        self
    }

    /// Records the identifier of the envelope that caused this one.
    pub fn caused_by(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);

        self
    }

    /// Sets the time-to-live of the envelope, in seconds.
    pub fn expiring_after_s(mut self, ttl_s: u64) -> Self {
        self.ttl_s = Some(ttl_s);

        self
    }

    /// Records the answer coordinates and marks the sender as blocking on
    /// the answer. Reserved for the answer-request path.
    pub(crate) fn answered_at(mut self, answer_topic: String, answer_id: Uuid) -> Self {
        self.answer = Some((answer_topic, answer_id));
        self.need_answer = true;

        self
    }
}

/// The handle of one started worker: its consumer tasks and their
/// cooperative stop signals.
pub struct WorkerHandle {
    name: String,
    input_halt: CancellationToken,
    answer_halt: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Assembles a handle from separately started consumer stages.
    pub(crate) fn from_stages(
        name: String,
        answer_stage: (CancellationToken, JoinHandle<()>),
        input_stage: (CancellationToken, JoinHandle<()>),
    ) -> Self {
        let (answer_halt, answer_task) = answer_stage;
        let (input_halt, input_task) = input_stage;

        Self {
            name,
            input_halt,
            answer_halt,
            tasks: vec![answer_task, input_task],
        }
    }

    /// Reports the logical name of the worker behind this handle.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops both consumers of this worker and waits for them to wind down.
    pub async fn stop(self) {
        self.input_halt.cancel();
        self.answer_halt.cancel();

        for task in self.tasks {
            let _ = task.await;
        }
    }
}

impl Mediator {
    /// Assembles a mediator from the given definitions: validates every
    /// cross-reference and builds one publisher instance per defined broker.
    pub fn assemble(
        registry: DefinitionRegistry,
        codec_registry: Arc<CodecRegistry>,
    ) -> Result<Self, MediatorError> {
        Self::assemble_with_error_topic(registry, codec_registry, DEFAULT_ERROR_TOPIC)
    }

    /// Same as [`assemble`](Mediator::assemble), with a custom error topic.
    pub fn assemble_with_error_topic(
        registry: DefinitionRegistry,
        codec_registry: Arc<CodecRegistry>,
        error_topic: impl AsRef<str>,
    ) -> Result<Self, MediatorError> {
        registry.validate()?;

        let memory_exchange = MemoryExchange::new();

        let mut publishers: HashMap<String, Arc<dyn Broker>> = HashMap::new();
        for definition in registry.brokers() {
            let publisher = Self::build_broker(definition, &codec_registry, &memory_exchange)?;
            publishers.insert(definition.name.clone(), publisher);
        }

        // Answers are routed by topic alone; map each answer topic back to
        // the broker of the worker that listens on it
        let mut answer_routes = HashMap::new();
        for worker in registry.workers() {
            answer_routes.insert(worker.answer_topic(), worker.broker.clone());
        }

        Ok(Self {
            inner: Arc::new(MediatorInner {
                registry,
                codec_registry,
                publishers,
                answer_routes,
                pending: PendingAnswers::default(),
                alone: AloneGuard::default(),
                memory_exchange,
                error_topic: error_topic.as_ref().to_string(),
            }),
        })
    }

    /// Exposes the definitions this mediator was assembled from.
    pub fn registry(&self) -> &DefinitionRegistry {
        &self.inner.registry
    }

    /// Exposes the in-process exchange shared by all memory brokers of this
    /// mediator.
    pub fn memory_exchange(&self) -> &MemoryExchange {
        &self.inner.memory_exchange
    }

    /// Reports the number of callers currently blocked on an answer.
    pub fn pending_answer_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Reports the error topic of this mediator.
    pub fn error_topic(&self) -> &str {
        &self.inner.error_topic
    }
}

impl Mediator {
    /// Builds a broker driver instance for the given definition.
    fn build_broker(
        definition: &BrokerDefinition,
        codec_registry: &Arc<CodecRegistry>,
        memory_exchange: &MemoryExchange,
    ) -> Result<Arc<dyn Broker>, MediatorError> {
        let codec = BrokerCodec::new(Arc::clone(codec_registry), &definition.codec)?;

        match definition.driver {
            BrokerDriver::Memory => Ok(Arc::new(MemoryBroker::new(
                &definition.name,
                codec,
                memory_exchange.clone(),
            ))),
            BrokerDriver::Log => Ok(Arc::new(LogBroker::new(&definition.name, codec))),
            BrokerDriver::Amqp => Self::build_amqp(definition, codec),
            BrokerDriver::Kafka => Self::build_kafka(definition, codec),
        }
    }

    #[cfg(feature = "amqp")]
    fn build_amqp(
        definition: &BrokerDefinition,
        codec: BrokerCodec,
    ) -> Result<Arc<dyn Broker>, MediatorError> {
        let props = conveyor_amqp::AmqpProps::from_dynamic(&definition.dynamic_props).map_err(
            |error| MediatorError::ConfigInvalid {
                reason: format!(
                    "broker '{}' carries invalid AMQP properties: {}",
                    definition.name, error,
                ),
            },
        )?;

        Ok(Arc::new(conveyor_amqp::AmqpBroker::pooled(
            &definition.name,
            codec,
            props,
            &conveyor_amqp::shared_pool(),
        )))
    }

    #[cfg(not(feature = "amqp"))]
    fn build_amqp(
        definition: &BrokerDefinition,
        _codec: BrokerCodec,
    ) -> Result<Arc<dyn Broker>, MediatorError> {
        Err(MediatorError::ConfigInvalid {
            reason: format!(
                "broker '{}' requires the 'amqp' feature of this crate",
                definition.name,
            ),
        })
    }

    #[cfg(feature = "kafka")]
    fn build_kafka(
        definition: &BrokerDefinition,
        codec: BrokerCodec,
    ) -> Result<Arc<dyn Broker>, MediatorError> {
        let props = conveyor_kafka::KafkaProps::from_dynamic(&definition.dynamic_props).map_err(
            |error| MediatorError::ConfigInvalid {
                reason: format!(
                    "broker '{}' carries invalid Kafka properties: {}",
                    definition.name, error,
                ),
            },
        )?;

        Ok(Arc::new(conveyor_kafka::KafkaBroker::pooled(
            &definition.name,
            codec,
            props,
            &conveyor_kafka::shared_pool(),
        )))
    }

    #[cfg(not(feature = "kafka"))]
    fn build_kafka(
        definition: &BrokerDefinition,
        _codec: BrokerCodec,
    ) -> Result<Arc<dyn Broker>, MediatorError> {
        Err(MediatorError::ConfigInvalid {
            reason: format!(
                "broker '{}' requires the 'kafka' feature of this crate",
                definition.name,
            ),
        })
    }

    /// Looks up the shared publisher instance of the given broker.
    fn publisher(&self, broker: &str) -> Result<Arc<dyn Broker>, MediatorError> {
        self.inner
            .publishers
            .get(broker)
            .cloned()
            .ok_or_else(|| MediatorError::ConfigInvalid {
                reason: format!("unknown broker '{}'", broker),
            })
    }

    /// Builds a fresh broker instance for a consumer unit. Consumers never
    /// share instances: one broker instance consumes at most once.
    pub(crate) fn consumer_broker(&self, broker: &str) -> Result<Arc<dyn Broker>, MediatorError> {
        let definition =
            self.inner
                .registry
                .broker(broker)
                .ok_or_else(|| MediatorError::ConfigInvalid {
                    reason: format!("unknown broker '{}'", broker),
                })?;

        Self::build_broker(
            definition,
            &self.inner.codec_registry,
            &self.inner.memory_exchange,
        )
    }

    /// Opens the connections of every publisher instance.
    pub async fn connect_brokers(&self) -> Result<(), MediatorError> {
        for publisher in self.inner.publishers.values() {
            publisher.connect().await?;
        }

        Ok(())
    }

    /// Closes every publisher instance, releasing its connection-pool
    /// references.
    pub async fn close_brokers(&self) {
        for (name, publisher) in &self.inner.publishers {
            if let Err(error) = publisher.close().await {
                warn!(
                    broker = name.as_str(),
                    ?error,
                    error_message = %error,
                    "Failed to cleanly close a broker",
                );
            }
        }
    }
}

impl Mediator {
    /// Publishes the given payload to the given worker, without awaiting an
    /// answer.
    pub async fn send(&self, worker: &str, payload: Value) -> Result<(), MediatorError> {
        self.send_with(worker, payload, SendOptions::default()).await
    }

    /// Publishes the given payload to the given worker with the given
    /// options.
    ///
    /// The payload is validated against the worker's input message schema
    /// before anything touches the wire. A failing payload produces an error
    /// envelope on the error topic and a
    /// [`PublishFailed`](MediatorError::PublishFailed) for the caller; the
    /// invalid payload itself is never published.
    pub async fn send_with(
        &self,
        worker: &str,
        payload: Value,
        options: SendOptions,
    ) -> Result<(), MediatorError> {
        let definition = self
            .inner
            .registry
            .worker(worker)
            .ok_or_else(|| MediatorError::UnknownWorker(worker.to_string()))?;

        let broker = self.publisher(&definition.broker)?;

        let message = self
            .inner
            .registry
            .message(&definition.input_message)
            .ok_or_else(|| MediatorError::ConfigInvalid {
                reason: format!("unknown message '{}'", definition.input_message),
            })?;

        if let Err(reason) = message.validate(&payload) {
            warn!(
                worker,
                message = message.name(),
                reason = reason.as_str(),
                "Refused to publish a payload that fails schema validation",
            );

            self.report_fault(
                &definition.broker,
                FaultTopic::MessagePayload,
                &reason,
                options.from_worker.as_deref(),
                options.parent_id,
            )
            .await;

            return Err(MediatorError::PublishFailed {
                worker: worker.to_string(),
                message: reason,
            });
        }

        // Alone sends are suppressed while their predecessor is enqueued
        let alone_key = options.alone.then(|| AloneGuard::key(worker, &payload));
        if let Some(key) = alone_key {
            if !self.inner.alone.acquire(key) {
                debug!(
                    worker,
                    "Suppressed an alone send: the previous message is still enqueued",
                );

                return Ok(());
            }
        }

        let mut builder = Envelope::with_payload(payload);

        if let Some(from_worker) = &options.from_worker {
            builder = builder.from_worker(from_worker);
        }

        if let Some(parent_id) = options.parent_id {
            builder = builder.caused_by(parent_id);
        }

        if let Some(ttl_s) = options.ttl_s {
            builder = builder.expiring_after_s(ttl_s);
        }

        if let Some((answer_topic, answer_id)) = &options.answer {
            builder = builder.answered_at(answer_topic, *answer_id);

            if options.need_answer {
                builder = builder.need_answer();
            }
        }

        let envelope = builder.build()?;

        let published = broker.publish(definition.topic(), &envelope).await;

        if let Err(error) = published {
            if let Some(key) = alone_key {
                self.inner.alone.release(key);
            }

            return Err(MediatorError::PublishFailed {
                worker: worker.to_string(),
                message: error.to_string(),
            });
        }

        debug!(
            worker,
            envelope_id = %envelope.id(),
            topic = definition.topic(),
            "Published an envelope",
        );

        Ok(())
    }

    /// Publishes the given payload to the given worker and blocks until the
    /// matching answer arrives on the caller's answer topic, or until the
    /// caller's deadline runs out.
    ///
    /// The pending-answer table is left clean on every exit path.
    pub(crate) async fn get_answer(
        &self,
        caller: &str,
        target: &str,
        payload: Value,
        parent_id: Option<Uuid>,
    ) -> Result<Envelope, MediatorError> {
        let caller_definition = self
            .inner
            .registry
            .worker(caller)
            .ok_or_else(|| MediatorError::UnknownWorker(caller.to_string()))?;

        let answer_topic = caller_definition.answer_topic();
        let deadline = Duration::from_secs(caller_definition.rpc_timeout_s);
        let answer_id = Uuid::new_v4();

        let receiver = self.inner.pending.register(answer_id);

        // The waiter must leave the table on every exit path
        let inner = Arc::clone(&self.inner);
        let _cleanup = scopeguard::guard((), move |_| {
            inner.pending.forget(answer_id);
        });

        let mut options = SendOptions::new()
            .from_worker(caller)
            .answered_at(answer_topic, answer_id);

        if let Some(parent_id) = parent_id {
            options = options.caused_by(parent_id);
        }

        self.send_with(target, payload, options).await?;

        select! {
            answer = receiver => answer.map_err(|_| MediatorError::RpcTimeout {
                worker: target.to_string(),
            }),
            _ = tokio::time::sleep(deadline) => Err(MediatorError::RpcTimeout {
                worker: target.to_string(),
            }),
        }
    }

    /// Publishes an answer envelope to the given answer topic, on the broker
    /// of the worker that listens there.
    pub(crate) async fn publish_answer(
        &self,
        answer_topic: &str,
        envelope: &Envelope,
    ) -> Result<(), MediatorError> {
        let broker_name = self.inner.answer_routes.get(answer_topic).ok_or_else(|| {
            MediatorError::ConfigInvalid {
                reason: format!("no worker listens on answer topic '{}'", answer_topic),
            }
        })?;

        let broker = self.publisher(broker_name)?;

        broker.publish(answer_topic, envelope).await?;

        Ok(())
    }

    /// Signals the waiter registered under the given correlation identifier.
    /// Reports whether a waiter was found.
    pub(crate) fn resolve_answer(&self, answer_id: Uuid, envelope: Envelope) -> bool {
        self.inner.pending.resolve(answer_id, envelope)
    }

    /// Routes an error envelope to the error topic of this mediator, via the
    /// given broker. Failures on this path are logged and swallowed: error
    /// reporting must never recurse.
    pub(crate) async fn report_fault(
        &self,
        broker: &str,
        topic: FaultTopic,
        reason: &str,
        from_worker: Option<&str>,
        parent_id: Option<Uuid>,
    ) {
        let publisher = match self.publisher(broker) {
            Ok(publisher) => publisher,
            Err(error) => {
                error!(
                    alert = true,
                    broker,
                    ?error,
                    "Cannot route an error envelope: unknown broker",
                );

                return;
            }
        };

        let mut builder = Envelope::with_fault(topic, reason);

        if let Some(from_worker) = from_worker {
            builder = builder.from_worker(from_worker);
        }

        if let Some(parent_id) = parent_id {
            builder = builder.caused_by(parent_id);
        }

        let envelope = match builder.build() {
            Ok(envelope) => envelope,
            Err(error) => {
                error!(alert = true, ?error, "Failed to build an error envelope");

                return;
            }
        };

        if let Err(error) = publisher.publish(&self.inner.error_topic, &envelope).await {
            error!(
                alert = true,
                broker,
                error_topic = self.inner.error_topic.as_str(),
                ?error,
                error_message = %error,
                "Failed to publish an error envelope",
            );
        }
    }

    /// Marks the in-flight alone message of the given worker as settled,
    /// allowing the next identical send to go through.
    pub(crate) fn settle_alone(&self, worker: &str, payload: &Value) {
        self.inner.alone.release(AloneGuard::key(worker, payload));
    }
}

impl Mediator {
    /// Starts the two consumers of the given worker — the answer-topic
    /// consumer first, then the input-topic consumer — and returns their
    /// handle.
    ///
    /// External workers have no local consumers and cannot be started.
    pub async fn start_worker(
        &self,
        name: &str,
        worker: Arc<dyn Worker>,
    ) -> Result<WorkerHandle, MediatorError> {
        let definition = self.consumable_worker(name)?;

        let (answer_halt, answer_task) = self.start_answer_stage(&definition);
        let (input_halt, input_task) = self.start_input_stage(&definition, worker);

        info!(worker = name, "Started a worker");

        Ok(WorkerHandle {
            name: name.to_string(),
            input_halt,
            answer_halt,
            tasks: vec![answer_task, input_task],
        })
    }

    /// Looks up the given worker and checks that it can be consumed locally.
    pub(crate) fn consumable_worker(
        &self,
        name: &str,
    ) -> Result<crate::WorkerDefinition, MediatorError> {
        let definition = self
            .inner
            .registry
            .worker(name)
            .ok_or_else(|| MediatorError::UnknownWorker(name.to_string()))?
            .clone();

        if definition.external {
            return Err(MediatorError::ConfigInvalid {
                reason: format!("worker '{}' is external and is never consumed locally", name),
            });
        }

        Ok(definition)
    }

    /// Starts the answer-topic consumer of the given worker, so that answers
    /// cannot arrive before anyone listens.
    pub(crate) fn start_answer_stage(
        &self,
        definition: &crate::WorkerDefinition,
    ) -> (CancellationToken, JoinHandle<()>) {
        let halt = CancellationToken::new();

        let task = self.spawn_consumer(
            format!("{}:answer", definition.name),
            definition.broker.clone(),
            definition.answer_topic(),
            definition.name.clone(),
            1,
            Arc::new(AnswerRunner {
                mediator: self.clone(),
            }),
            self.retry_delay_of(&definition.broker),
            halt.clone(),
        );

        (halt, task)
    }

    /// Starts the input-topic consumer of the given worker, carrying the
    /// worker logic.
    pub(crate) fn start_input_stage(
        &self,
        definition: &crate::WorkerDefinition,
        worker: Arc<dyn Worker>,
    ) -> (CancellationToken, JoinHandle<()>) {
        let halt = CancellationToken::new();

        let runner = WorkerRunner::new(self.clone(), definition.clone(), worker, halt.clone());

        let task = self.spawn_consumer(
            format!("{}:input", definition.name),
            definition.broker.clone(),
            definition.topic().to_string(),
            definition.name.clone(),
            definition.prefetch,
            Arc::new(runner),
            self.retry_delay_of(&definition.broker),
            halt.clone(),
        );

        (halt, task)
    }

    /// Reports the configured consumer retry delay of the given broker.
    fn retry_delay_of(&self, broker: &str) -> Duration {
        self.inner
            .registry
            .broker(broker)
            .map(|definition| Duration::from_secs(definition.retry_delay_s))
            .unwrap_or(Duration::from_secs(3))
    }

    /// Spawns a consume loop that restarts its broker instance with the
    /// configured retry delay whenever consumption aborts with an error.
    #[allow(clippy::too_many_arguments)]
    fn spawn_consumer(
        &self,
        label: String,
        broker_name: String,
        topic: String,
        worker_name: String,
        prefetch: u16,
        handler: Arc<dyn DeliveryHandler>,
        retry_delay: Duration,
        halt: CancellationToken,
    ) -> JoinHandle<()> {
        let mediator = self.clone();

        tokio::spawn(async move {
            let _token = Spindown::register(format!("conveyor:consumer:{}", label));

            // A jittered constant delay spaces out the restarts
            let backoff = Backoff::new(BackoffConfig::constant(retry_delay));

            loop {
                let broker = match mediator.consumer_broker(&broker_name) {
                    Ok(broker) => broker,
                    Err(error) => {
                        error!(
                            alert = true,
                            consumer = label.as_str(),
                            ?error,
                            error_message = %error,
                            "Cannot build a broker instance for a consumer",
                        );

                        // An internal fault this deep leaves the pipeline
                        // unhealthy; report and drain the whole run
                        mediator
                            .report_fault(
                                &broker_name,
                                FaultTopic::System,
                                &error.to_string(),
                                None,
                                None,
                            )
                            .await;

                        RunContext::terminate();

                        return;
                    }
                };

                let mut binding = ConsumerBinding::new(&topic, &worker_name)
                    .with_prefetch(prefetch)
                    .with_consumer_tag(&label);
                binding.halt = halt.clone();

                let outcome = broker.consume(binding, Arc::clone(&handler)).await;

                // This instance is done either way; release its pool lease
                if let Err(error) = broker.close().await {
                    warn!(
                        consumer = label.as_str(),
                        ?error,
                        error_message = %error,
                        "Failed to cleanly close a consumer's broker instance",
                    );
                }

                match outcome {
                    // Cooperative stop
                    Ok(()) => {
                        info!(consumer = label.as_str(), "Consumer stopped");

                        return;
                    }

                    // Abort: restart after the retry delay
                    Err(error) => {
                        warn!(
                            alert = true,
                            consumer = label.as_str(),
                            ?error,
                            error_message = %error,
                            "Consumer aborted; restarting after the retry delay",
                        );

                        select! {
                            biased;
                            _ = RunContext::terminated() => return,
                            _ = halt.cancelled() => return,
                            _ = backoff.sleep_next() => {}
                        }
                    }
                }
            }
        })
    }
}

/// Consumes a worker's answer topic, matching incoming envelopes against the
/// pending-answer table.
struct AnswerRunner {
    mediator: Mediator,
}

#[async_trait]
impl DeliveryHandler for AnswerRunner {
    async fn handle(&self, envelope: Envelope, lease: DeliveryLease) {
        // Answers are never retried
        lease.ack().await;

        let Some(answer_id) = envelope.answer_id() else {
            warn!(
                envelope_id = %envelope.id(),
                "Discarded an answer-topic envelope without a correlation id",
            );

            return;
        };

        if !self.mediator.resolve_answer(answer_id, envelope) {
            debug!(
                answer_id = %answer_id,
                "Discarded an answer that no caller is waiting on",
            );
        }
    }
}

/// Tracks alone messages that are published but not yet settled by their
/// consumer, keyed by a hash of (worker, payload).
#[derive(Default)]
struct AloneGuard {
    inflight: SyncMutex<HashSet<u64>>,
}

impl AloneGuard {
    /// Hashes the identity of an alone message.
    fn key(worker: &str, payload: &Value) -> u64 {
        let mut hasher = DefaultHasher::new();

        worker.hash(&mut hasher);
        payload.to_string().hash(&mut hasher);

        hasher.finish()
    }

    /// Claims the given key. Reports `false` when it is already in flight.
    fn acquire(&self, key: u64) -> bool {
        self.inflight.lock().insert(key)
    }

    /// Releases the given key.
    fn release(&self, key: u64) {
        self.inflight.lock().remove(&key);
    }
}
