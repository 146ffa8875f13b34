#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(test, deny(warnings))]

/// Exposes the poolable Kafka producer target.
mod target;
pub use self::target::KafkaTarget;

/// Exposes the driver-specific configuration.
mod config;
pub use self::config::KafkaProps;

/// Exposes the Kafka broker driver.
mod broker;
pub use self::broker::KafkaBroker;

use conveyor_transport::ConnectionPool;
use std::sync::{Arc, OnceLock};

// Process-wide default pool of Kafka producer clients
static POOL: OnceLock<Arc<ConnectionPool<KafkaTarget>>> = OnceLock::new();

/// Retrieves the process-wide default [`ConnectionPool`] for Kafka targets,
/// lazily initialized.
///
/// Brokers constructed without an explicit pool share this one. Tests should
/// wire their own pool instead.
pub fn shared_pool() -> Arc<ConnectionPool<KafkaTarget>> {
    Arc::clone(POOL.get_or_init(ConnectionPool::new))
}
