#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(test, deny(warnings))]

/// Exposes the global run context.
mod context;
pub use self::context::RunContext;

/// Exposes the spindown machinery for graceful completion of background
/// workloads.
mod spindown {
    pub mod registry;
    pub mod token;
}
pub use self::spindown::registry::Spindown;
pub use self::spindown::token::SpindownToken;

/// Exposes an opinionated exponential backoff.
mod backoff;
pub use self::backoff::{Backoff, BackoffConfig};

/// Awaits the graceful completion of all registered background workloads.
///
/// A host application should await on this function as the last thing before
/// returning from its main logic, to give the pipeline components (broker
/// connections, consumer loops, the cron driver) a chance to clean up.
pub async fn conveyor_shutdown() {
    Spindown::completed().await;
}
