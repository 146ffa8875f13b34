use conveyor_codec::CodecError;
use conveyor_transport::{BrokerError, EnvelopeError};
use thiserror::Error;

/// Represents a failure within the mediator and its satellites.
#[derive(Error, Debug)]
pub enum MediatorError {
    /// The definitions are malformed or inconsistent. Fatal at startup.
    #[error("invalid configuration: {reason}")]
    ConfigInvalid {
        /// What exactly is wrong.
        reason: String,
    },

    /// A definition was registered twice under the same name.
    #[error("duplicate {kind} definition '{name}'")]
    DefinitionDuplicate {
        /// The definition section (`broker`, `message`, `worker`, `cron`,
        /// `waiting`).
        kind: &'static str,
        /// The offending name.
        name: String,
    },

    /// A message was addressed to a worker that is not registered.
    #[error("unknown worker '{0}'")]
    UnknownWorker(String),

    /// A publish did not go through. Covers both broker-side failures and
    /// payloads that failed schema validation (the error envelope is routed
    /// to the error topic separately).
    #[error("failed to publish to worker '{worker}': {message}")]
    PublishFailed {
        /// The addressed worker.
        worker: String,
        /// The underlying reason, stringified.
        message: String,
    },

    /// A consumer manager issued an answer request while another one is
    /// already in flight on the same manager.
    #[error("a nested answer request is already in flight on this consumer")]
    RpcNested,

    /// A blocking answer request ran out of its deadline.
    #[error("timed out waiting for an answer from worker '{worker}'")]
    RpcTimeout {
        /// The worker that did not answer in time.
        worker: String,
    },

    /// A waiting did not become healthy within its timeout.
    #[error("waiting '{name}' did not become healthy within {timeout_s}s")]
    WaitingTimeout {
        /// The name of the waiting.
        name: String,
        /// The exhausted timeout, in seconds.
        timeout_s: u64,
    },

    /// A broker driver failure.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// A codec failure.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A structurally invalid envelope.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}
