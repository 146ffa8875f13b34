use crate::definition::worker::WorkerDefinition;
use crate::error::MediatorError;
use crate::mediator::{Mediator, SendOptions};
use async_trait::async_trait;
use conveyor_core::RunContext;
use conveyor_transport::{DeliveryHandler, DeliveryLease, Envelope, FaultTopic};
use parking_lot::Mutex as SyncMutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use uuid::Uuid;

/// The contract of a worker: user logic bound to one input topic through a
/// [`WorkerDefinition`].
///
/// The handler receives the incoming envelope and the per-message
/// [`ConsumerManager`]. Returning `Ok` settles the delivery positively; the
/// returned payload, if any, answers a caller that is blocking on this
/// message. Returning `Err` engages the retry policy: the delivery is
/// requeued up to the definition's `max_retries`, then settled with an error
/// envelope on the error topic.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Handles a single incoming envelope.
    async fn handle(
        &self,
        envelope: &Envelope,
        manager: &ConsumerManager,
    ) -> Result<Option<Value>, WorkerFault>;
}

/// Represents a failure inside a worker handler.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct WorkerFault {
    message: String,
}

impl WorkerFault {
    /// Creates a fault with the given message.
    pub fn new(message: impl AsRef<str>) -> Self {
        Self {
            message: message.as_ref().to_string(),
        }
    }
}

impl From<String> for WorkerFault {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for WorkerFault {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// The per-message handle passed to a [`Worker`] alongside every incoming
/// envelope.
///
/// Bound to exactly one in-flight delivery. Beyond finalization
/// ([`ack`](ConsumerManager::ack), [`reject`](ConsumerManager::reject)), it
/// carries the two publishing helpers of the pipeline:
/// [`send_to`](ConsumerManager::send_to) for fire-and-forget and
/// [`get_answer_from`](ConsumerManager::get_answer_from) for blocking
/// request/response. At most one answer request may be in flight per
/// manager; a nested one fails with [`MediatorError::RpcNested`].
pub struct ConsumerManager {
    id: Uuid,
    mediator: Mediator,
    worker_name: Arc<str>,
    envelope_id: Uuid,
    lease: Arc<DeliveryLease>,
    rpc_inflight: AtomicBool,
    halt: CancellationToken,
}

impl ConsumerManager {
    /// Internal constructor.
    fn new(
        mediator: Mediator,
        worker_name: Arc<str>,
        envelope_id: Uuid,
        lease: Arc<DeliveryLease>,
        halt: CancellationToken,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            mediator,
            worker_name,
            envelope_id,
            lease,
            rpc_inflight: AtomicBool::new(false),
            halt,
        }
    }

    /// Reports the unique identifier of this manager.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Positively acknowledges the in-flight delivery. Idempotent: at most
    /// one acknowledgement ever reaches the broker.
    pub async fn ack(&self) {
        self.lease.ack().await;
    }

    /// Negatively acknowledges the in-flight delivery, requeueing it where
    /// the broker supports requeueing.
    pub async fn reject(&self) {
        self.lease.reject().await;
    }

    /// Publishes the given payload to another worker without awaiting an
    /// answer.
    pub async fn send_to(
        &self,
        worker: &str,
        payload: Value,
        alone: bool,
    ) -> Result<(), MediatorError> {
        let mut options = SendOptions::new()
            .from_worker(self.worker_name.as_ref())
            .caused_by(self.envelope_id);

        if alone {
            options = options.alone();
        }

        self.mediator.send_with(worker, payload, options).await
    }

    /// Publishes the given payload to another worker and blocks this
    /// consumer until the matching answer envelope arrives, or until this
    /// worker's answer deadline runs out with
    /// [`MediatorError::RpcTimeout`].
    pub async fn get_answer_from(
        &self,
        worker: &str,
        payload: Value,
    ) -> Result<Envelope, MediatorError> {
        // One blocking answer request per consumer; nesting is forbidden
        if self.rpc_inflight.swap(true, Ordering::SeqCst) {
            return Err(MediatorError::RpcNested);
        }

        let answer = self
            .mediator
            .get_answer(&self.worker_name, worker, payload, Some(self.envelope_id))
            .await;

        self.rpc_inflight.store(false, Ordering::SeqCst);

        answer
    }

    /// Initiates cooperative shutdown of the current consumer: no further
    /// deliveries are fetched once the in-flight one is finalized.
    pub fn stop_consuming(&self) {
        self.halt.cancel();
    }

    /// Initiates cooperative shutdown of the entire pipeline run.
    pub fn exit(&self) {
        RunContext::terminate();
    }
}

/// Drives one worker's input topic: validates incoming payloads, invokes the
/// user handler, applies the retry policy, and answers blocked callers.
pub(crate) struct WorkerRunner {
    mediator: Mediator,
    definition: WorkerDefinition,
    worker_name: Arc<str>,
    worker: Arc<dyn Worker>,
    attempts: SyncMutex<HashMap<Uuid, u32>>,
    halt: CancellationToken,
}

impl WorkerRunner {
    /// Creates a runner for the given worker.
    pub(crate) fn new(
        mediator: Mediator,
        definition: WorkerDefinition,
        worker: Arc<dyn Worker>,
        halt: CancellationToken,
    ) -> Self {
        let worker_name = Arc::from(definition.name.as_str());

        Self {
            mediator,
            definition,
            worker_name,
            worker,
            attempts: SyncMutex::new(HashMap::new()),
            halt,
        }
    }

    /// Records one more failure of the given envelope and reports the
    /// failure count so far.
    fn bump_attempt(&self, envelope_id: Uuid) -> u32 {
        let mut attempts = self.attempts.lock();
        let attempt = attempts.entry(envelope_id).or_insert(0);
        *attempt += 1;

        *attempt
    }

    /// Finishes the book-keeping of a settled delivery.
    fn settle(&self, envelope: &Envelope) {
        self.attempts.lock().remove(&envelope.id());
        self.mediator
            .settle_alone(&self.definition.name, envelope.payload());
    }

    /// Answers the caller blocked on the given envelope, if there is one.
    ///
    /// A successful handler output is validated against the worker's output
    /// message schema; anything that cannot be answered properly is answered
    /// with an error envelope instead, so that the caller unblocks either
    /// way.
    async fn answer(&self, envelope: &Envelope, output: Result<Option<Value>, &WorkerFault>) {
        let (Some(answer_topic), Some(answer_id)) =
            (envelope.answer_to_topic(), envelope.answer_id())
        else {
            return;
        };

        if !envelope.real_need_answer() {
            return;
        }

        let builder = match output {
            Ok(Some(payload)) => match self.validate_output(&payload) {
                Ok(()) => Envelope::with_payload(payload),
                Err(reason) => {
                    self.mediator
                        .report_fault(
                            &self.definition.broker,
                            FaultTopic::MessagePayload,
                            &reason,
                            Some(&self.definition.name),
                            Some(envelope.id()),
                        )
                        .await;

                    Envelope::with_fault(FaultTopic::MessagePayload, &reason)
                }
            },
            Ok(None) => Envelope::with_fault(
                FaultTopic::HandleMessage,
                "the worker produced no answer payload",
            ),
            Err(fault) => Envelope::with_fault(FaultTopic::HandleMessage, fault.to_string()),
        };

        let answer = builder
            .from_worker(&self.definition.name)
            .caused_by(envelope.id())
            .answered_at(answer_topic, answer_id)
            .build();

        let answer = match answer {
            Ok(answer) => answer,
            Err(error) => {
                error!(
                    worker = self.worker_name.as_ref(),
                    ?error,
                    "Failed to build an answer envelope",
                );

                return;
            }
        };

        if let Err(error) = self.mediator.publish_answer(answer_topic, &answer).await {
            error!(
                alert = true,
                worker = self.worker_name.as_ref(),
                answer_topic,
                ?error,
                error_message = %error,
                "Failed to publish an answer envelope",
            );
        }
    }

    /// Validates an answer payload against the worker's output message
    /// schema, if one is declared.
    fn validate_output(&self, payload: &Value) -> Result<(), String> {
        let Some(output_message) = &self.definition.output_message else {
            return Ok(());
        };

        match self.mediator.registry().message(output_message) {
            Some(message) => message.validate(payload),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DeliveryHandler for WorkerRunner {
    async fn handle(&self, envelope: Envelope, lease: DeliveryLease) {
        let lease = Arc::new(lease);

        // Gate the payload on the input schema; a poison message is settled
        // with an error envelope and must not recycle
        if let Some(message) = self.mediator.registry().message(&self.definition.input_message)
        {
            if let Err(reason) = message.validate(envelope.payload()) {
                error!(
                    alert = true,
                    worker = self.worker_name.as_ref(),
                    envelope_id = %envelope.id(),
                    reason = reason.as_str(),
                    "Received a payload that fails schema validation",
                );

                self.mediator
                    .report_fault(
                        &self.definition.broker,
                        FaultTopic::MessagePayload,
                        &reason,
                        Some(&self.definition.name),
                        Some(envelope.id()),
                    )
                    .await;

                lease.ack().await;
                self.settle(&envelope);

                return;
            }
        }

        let manager = ConsumerManager::new(
            self.mediator.clone(),
            Arc::clone(&self.worker_name),
            envelope.id(),
            Arc::clone(&lease),
            self.halt.clone(),
        );

        let outcome = self.worker.handle(&envelope, &manager).await;

        match outcome {
            Ok(output) => {
                self.answer(&envelope, Ok(output)).await;

                lease.ack().await;
                self.settle(&envelope);
            }

            Err(fault) => {
                let failures = self.bump_attempt(envelope.id());

                // Retry by requeueing, unless the handler already settled
                // the delivery or the retry budget ran out
                if !lease.is_settled() && failures <= self.definition.max_retries {
                    warn!(
                        worker = self.worker_name.as_ref(),
                        envelope_id = %envelope.id(),
                        failures,
                        max_retries = self.definition.max_retries,
                        fault = %fault,
                        "Worker handler failed; requeueing the delivery",
                    );

                    lease.reject().await;

                    return;
                }

                error!(
                    alert = true,
                    worker = self.worker_name.as_ref(),
                    envelope_id = %envelope.id(),
                    failures,
                    fault = %fault,
                    "Worker handler failed terminally; settling with an error envelope",
                );

                self.mediator
                    .report_fault(
                        &self.definition.broker,
                        FaultTopic::HandleMessage,
                        &fault.to_string(),
                        Some(&self.definition.name),
                        Some(envelope.id()),
                    )
                    .await;

                // A blocked caller must unblock either way
                self.answer(&envelope, Err(&fault)).await;

                lease.ack().await;
                self.settle(&envelope);
            }
        }
    }
}
