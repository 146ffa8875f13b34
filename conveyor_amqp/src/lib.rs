#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(test, deny(warnings))]

/// Exposes the poolable AMQP connection target.
mod target;
pub use self::target::AmqpTarget;

/// Exposes the driver-specific configuration.
mod config;
pub use self::config::AmqpProps;

/// Exposes the AMQP broker driver.
mod broker;
pub use self::broker::AmqpBroker;

use conveyor_transport::ConnectionPool;
use std::sync::{Arc, OnceLock};

// Process-wide default pool of AMQP connections
static POOL: OnceLock<Arc<ConnectionPool<AmqpTarget>>> = OnceLock::new();

/// Retrieves the process-wide default [`ConnectionPool`] for AMQP targets,
/// lazily initialized.
///
/// Brokers constructed without an explicit pool share this one. Tests should
/// wire their own pool instead.
pub fn shared_pool() -> Arc<ConnectionPool<AmqpTarget>> {
    Arc::clone(POOL.get_or_init(ConnectionPool::new))
}
