#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(test, deny(warnings))]

/// Exposes the message envelope.
mod envelope;
pub use self::envelope::{Envelope, EnvelopeBuilder, EnvelopeError, EnvelopeFault, FaultTopic};

/// Exposes the uniform broker contract.
mod broker;
pub use self::broker::{
    Broker, BrokerCodec, BrokerError, ConsumerBinding, DeliveryHandler, TransportHeaders,
    WirePayload,
};

/// Exposes the per-message finalization handle.
mod delivery;
pub use self::delivery::{DeliveryLease, Finalizer};

/// Exposes the reference-counted connection pool.
mod pool;
pub use self::pool::{Connectable, ConnectionPool, PoolError, PoolManager};

/// Exposes the in-process memory broker.
mod memory;
pub use self::memory::{MemoryBroker, MemoryExchange};

/// Exposes the emit-only log broker.
mod log;
pub use self::log::LogBroker;

/// The name of the transport header that carries the compression name of a
/// published message.
pub const HEADER_COMPRESSION: &str = "compression";

/// The name of the transport header that carries the content type of a
/// published message, on drivers without a native content-type property.
pub const HEADER_CONTENT_TYPE: &str = "content_type";
