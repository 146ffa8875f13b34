use backoff::backoff::Backoff as InnerBackoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use parking_lot::Mutex as SyncMutex;
use std::time::Duration;

/// Configuration of the exponential [`Backoff`].
///
/// The defaults are tuned for broker reconnection attempts: start fast, back
/// off to a modest ceiling, never give up (retrying forever is the mediator's
/// job to bound).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// The first interval to wait after the first failure.
    pub initial_interval: Duration,
    /// The ceiling for intervals produced by this backoff.
    pub max_interval: Duration,
    /// The randomization factor applied to every produced interval.
    pub randomization_factor: f64,
    /// The multiplier applied between consecutive intervals.
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            randomization_factor: 0.5,
            multiplier: 1.5,
        }
    }
}

impl BackoffConfig {
    /// Builds a [`BackoffConfig`] with the given fixed retry delay as both
    /// the initial and the maximum interval, effectively producing a constant
    /// (jittered) delay.
    pub fn constant(delay: Duration) -> Self {
        Self {
            initial_interval: delay,
            max_interval: delay,
            ..Self::default()
        }
    }
}

impl AsRef<BackoffConfig> for BackoffConfig {
    fn as_ref(&self) -> &BackoffConfig {
        self
    }
}

/// Thin wrapper around [`ExponentialBackoff`] that provides light-weight
/// synchronization for interior mutability, a sleeping convenience method,
/// and opinionated defaults.
pub struct Backoff {
    inner: SyncMutex<ExponentialBackoff>,
}

impl Backoff {
    /// Builds a new [`Backoff`] based on the given [`BackoffConfig`].
    pub fn new(config: impl AsRef<BackoffConfig>) -> Self {
        let config = config.as_ref();
        let inner = ExponentialBackoffBuilder::new()
            .with_initial_interval(config.initial_interval)
            .with_max_interval(config.max_interval)
            .with_randomization_factor(config.randomization_factor)
            .with_multiplier(config.multiplier)
            .with_max_elapsed_time(None) // broker outages are not time-boxed
            .build();

        Self {
            inner: SyncMutex::new(inner),
        }
    }

    /// Returns the next backoff interval.
    pub fn next(&self) -> Option<Duration> {
        self.inner.lock().next_backoff()
    }

    /// Sleeps for the next backoff interval.
    pub async fn sleep_next(&self) {
        match self.next() {
            Some(duration) => tokio::time::sleep(duration).await,
            None => tokio::task::yield_now().await,
        }
    }

    /// Resets this backoff to the initial interval.
    pub fn reset(&self) {
        self.inner.lock().reset();
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
