use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Represents the on-wire record of a single pipeline message.
///
/// An envelope carries either a structured payload or an [error
/// descriptor](EnvelopeFault) — never both, never neither — along with the
/// metadata that enables tracing (`parent_id`, `worker_creator`) and
/// request/response over one-way queues (`answer_to_topic`, `answer_id`).
///
/// Envelopes are immutable once built. Follow-up envelopes (answers, error
/// reports) are derived through fresh [builders](EnvelopeBuilder).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    id: Uuid,
    date_created: DateTime<Utc>,
    payload: Value,
    worker_creator: Option<String>,
    parent_id: Option<Uuid>,
    answer_to_topic: Option<String>,
    answer_id: Option<Uuid>,
    real_need_answer: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<EnvelopeFault>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ttl_s: Option<u64>,
}

/// The error descriptor carried by an error envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeFault {
    /// The category of the fault.
    pub topic: FaultTopic,
    /// A human-readable description of the fault.
    pub message: String,
}

/// The category of a fault carried by an error envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FaultTopic {
    /// The payload of an incoming message failed schema validation.
    MessagePayload,
    /// A worker handler failed while processing a message.
    HandleMessage,
    /// An unexpected internal fault.
    System,
}

/// Represents a structurally invalid envelope.
#[derive(Error, Debug)]
#[error("invalid envelope: {reason}")]
pub struct EnvelopeError {
    reason: String,
}

impl EnvelopeError {
    fn new(reason: impl AsRef<str>) -> Self {
        Self {
            reason: reason.as_ref().to_string(),
        }
    }
}

impl Envelope {
    /// Starts building an envelope around the given payload.
    pub fn with_payload(payload: Value) -> EnvelopeBuilder {
        EnvelopeBuilder::new(payload, None)
    }

    /// Starts building an error envelope around the given fault.
    pub fn with_fault(topic: FaultTopic, message: impl AsRef<str>) -> EnvelopeBuilder {
        let fault = EnvelopeFault {
            topic,
            message: message.as_ref().to_string(),
        };

        EnvelopeBuilder::new(Value::Null, Some(fault))
    }

    /// Reconstructs an envelope from its dictionary form, as decoded from the
    /// wire, enforcing the structural invariants.
    pub fn from_dict(dict: Value) -> Result<Self, EnvelopeError> {
        let envelope: Envelope = serde_json::from_value(dict)
            .map_err(|error| EnvelopeError::new(error.to_string()))?;

        envelope.verify()?;

        Ok(envelope)
    }

    /// Converts this envelope into its dictionary form for the codec layer.
    pub fn to_dict(&self) -> Value {
        // An envelope is always representable as a JSON value tree
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Checks the structural invariants of this envelope.
    fn verify(&self) -> Result<(), EnvelopeError> {
        if self.error.is_some() && !self.payload.is_null() {
            return Err(EnvelopeError::new(
                "an envelope carries either a payload or an error, not both",
            ));
        }

        if self.error.is_none() && self.payload.is_null() {
            return Err(EnvelopeError::new(
                "an envelope carries either a payload or an error, not neither",
            ));
        }

        if self.answer_to_topic.is_some() != self.answer_id.is_some() {
            return Err(EnvelopeError::new(
                "answer_to_topic and answer_id must be set together",
            ));
        }

        Ok(())
    }
}

impl Envelope {
    /// Exposes the unique identifier of this envelope.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Exposes the creation timestamp of this envelope.
    pub fn date_created(&self) -> DateTime<Utc> {
        self.date_created
    }

    /// Exposes the payload of this envelope ([`Value::Null`] for error
    /// envelopes).
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Exposes the logical name of the worker that emitted this envelope, if
    /// it originated inside the pipeline.
    pub fn worker_creator(&self) -> Option<&str> {
        self.worker_creator.as_deref()
    }

    /// Exposes the identifier of the envelope that caused this one.
    pub fn parent_id(&self) -> Option<Uuid> {
        self.parent_id
    }

    /// Exposes the topic to which a response envelope must be published, if
    /// an answer was requested.
    pub fn answer_to_topic(&self) -> Option<&str> {
        self.answer_to_topic.as_deref()
    }

    /// Exposes the correlation identifier the caller is waiting on, if an
    /// answer was requested.
    pub fn answer_id(&self) -> Option<Uuid> {
        self.answer_id
    }

    /// Reports whether the caller is blocking on an answer to this envelope.
    pub fn real_need_answer(&self) -> bool {
        self.real_need_answer
    }

    /// Exposes the error descriptor of this envelope, if it is an error
    /// envelope.
    pub fn error(&self) -> Option<&EnvelopeFault> {
        self.error.as_ref()
    }

    /// Exposes the time-to-live of this envelope, in seconds.
    pub fn ttl_s(&self) -> Option<u64> {
        self.ttl_s
    }

    /// Reports whether this envelope is an error envelope.
    pub fn is_fault(&self) -> bool {
        self.error.is_some()
    }

    /// Reports whether this envelope has outlived its time-to-live as of the
    /// given moment. A broker may drop expired envelopes without delivering.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl_s {
            Some(ttl_s) => {
                let age = now.signed_duration_since(self.date_created);

                age.num_seconds() >= 0 && age.num_seconds() as u64 >= ttl_s
            }
            None => false,
        }
    }
}

/// Allows building an [`Envelope`] iteratively.
///
/// The builder assigns a fresh identifier and the current timestamp at
/// [build](EnvelopeBuilder::build) time and enforces the envelope's
/// structural invariants.
pub struct EnvelopeBuilder {
    payload: Value,
    error: Option<EnvelopeFault>,
    worker_creator: Option<String>,
    parent_id: Option<Uuid>,
    answer_to_topic: Option<String>,
    answer_id: Option<Uuid>,
    real_need_answer: bool,
    ttl_s: Option<u64>,
}

impl EnvelopeBuilder {
    /// Internal constructor.
    fn new(payload: Value, error: Option<EnvelopeFault>) -> Self {
        Self {
            payload,
            error,
            worker_creator: None,
            parent_id: None,
            answer_to_topic: None,
            answer_id: None,
            real_need_answer: false,
            ttl_s: None,
        }
    }

    /// Records the logical name of the worker emitting this envelope.
    pub fn from_worker(mut self, worker: impl AsRef<str>) -> Self {
        self.worker_creator = Some(worker.as_ref().to_string());

        self
    }

    /// Records the identifier of the envelope that caused this one.
    pub fn caused_by(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);

        self
    }

    /// Records the answer coordinates: the topic to publish the response to
    /// and the correlation identifier the caller will wait on.
    ///
    /// The two are only ever set together, which upholds the envelope's
    /// correlation invariant by construction.
    pub fn answered_at(mut self, topic: impl AsRef<str>, answer_id: Uuid) -> Self {
        self.answer_to_topic = Some(topic.as_ref().to_string());
        self.answer_id = Some(answer_id);

        self
    }

    /// Marks the caller as blocking on an answer.
    pub fn need_answer(mut self) -> Self {
        self.real_need_answer = true;

        self
    }

    /// Sets the time-to-live of this envelope, in seconds.
    pub fn expiring_after_s(mut self, ttl_s: u64) -> Self {
        self.ttl_s = Some(ttl_s);

        self
    }

    /// Finalizes the envelope, assigning its identity and timestamp.
    pub fn build(self) -> Result<Envelope, EnvelopeError> {
        let envelope = Envelope {
            id: Uuid::new_v4(),
            date_created: Utc::now(),
            payload: self.payload,
            worker_creator: self.worker_creator,
            parent_id: self.parent_id,
            answer_to_topic: self.answer_to_topic,
            answer_id: self.answer_id,
            real_need_answer: self.real_need_answer,
            error: self.error,
            ttl_s: self.ttl_s,
        };

        envelope.verify()?;

        Ok(envelope)
    }
}
