#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(test, deny(warnings))]

/// Exposes the declarative definitions that the mediator is assembled from.
mod definition {
    pub mod broker;
    pub mod cron;
    pub mod message;
    pub mod waiting;
    pub mod worker;
}

// Re-export definition types
pub use self::definition::broker::{BrokerDefinition, BrokerDriver};
pub use self::definition::cron::CronTaskDefinition;
pub use self::definition::message::MessageDefinition;
pub use self::definition::waiting::WaitingDefinition;
pub use self::definition::worker::WorkerDefinition;

/// Exposes the mediator error type.
mod error;
pub use self::error::MediatorError;

/// Exposes the registry of validated definitions.
mod registry;
pub use self::registry::{CompiledMessage, DefinitionRegistry};

/// Exposes the pending-answer table (internal).
mod pending;

/// Exposes the central mediator.
mod mediator;
pub use self::mediator::{Mediator, SendOptions, WorkerHandle};

/// Exposes the worker contract and the per-message consumer manager.
mod worker;
pub use self::worker::{ConsumerManager, Worker, WorkerFault};

/// Exposes the cron driver.
mod cron;
pub use self::cron::CronDriver;

/// Exposes the waiting probes.
mod waiting;
pub use self::waiting::probe_waiting;

/// Exposes the pipeline runtime (startup and shutdown).
mod runtime;
pub use self::runtime::{PipelineRuntime, RuntimeOutcome};

// Re-export the transport types that appear in this crate's API
pub use conveyor_transport::{
    Envelope, EnvelopeBuilder, EnvelopeError, EnvelopeFault, FaultTopic, MemoryExchange,
};

// Re-export the codec types that appear in broker definitions
pub use conveyor_codec::{CodecDescriptor, CodecRegistry};

// Re-export the lifecycle facades that hosts drive directly
pub use conveyor_core::{RunContext, Spindown, SpindownToken};

/// Re-exports the `conveyor_shutdown` function to facilitate stand-alone
/// usage of the mediator without the [`PipelineRuntime`].
///
/// When driving the mediator manually, await on this function as a last
/// thing before completing the main application logic.
pub use conveyor_core::conveyor_shutdown;
