use crate::broker::BrokerError;
use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use std::sync::Arc;
use tracing::{error, warn};

/// The driver-side half of finalizing a single delivery.
///
/// Each driver supplies its own implementation: the AMQP driver wraps the
/// delivery's acker, the Kafka driver commits or rewinds offsets, the memory
/// driver re-queues in place. Idempotence is not the finalizer's concern —
/// the owning [`DeliveryLease`] guarantees at most one call ever reaches it.
#[async_trait]
pub trait Finalizer: Send + Sync {
    /// Positively acknowledges the delivery with the broker.
    async fn complete(&self) -> Result<(), BrokerError>;

    /// Negatively acknowledges the delivery, requeueing it where the driver
    /// supports requeueing.
    async fn requeue(&self) -> Result<(), BrokerError>;
}

/// The per-message finalization handle passed to a
/// [`DeliveryHandler`](crate::DeliveryHandler) alongside every incoming
/// envelope.
///
/// A lease is bound to exactly one delivery and can be settled exactly once:
/// the first [`ack`](DeliveryLease::ack) or [`reject`](DeliveryLease::reject)
/// wins, and every subsequent call is silently suppressed. Dropping an
/// unsettled lease is a bug in the consuming logic and is reported at the
/// error level.
pub struct DeliveryLease {
    consumer: Arc<str>,
    finalizer: SyncMutex<Option<Arc<dyn Finalizer>>>,
}

impl DeliveryLease {
    /// Creates a lease over the given finalizer, attributed to the given
    /// consumer name for logging purposes.
    pub fn new(consumer: impl AsRef<str>, finalizer: Arc<dyn Finalizer>) -> Self {
        Self {
            consumer: Arc::from(consumer.as_ref()),
            finalizer: SyncMutex::new(Some(finalizer)),
        }
    }

    /// Creates a lease that requires no broker-side finalization (used by
    /// drivers whose deliveries are settled implicitly).
    pub fn settled(consumer: impl AsRef<str>) -> Self {
        Self {
            consumer: Arc::from(consumer.as_ref()),
            finalizer: SyncMutex::new(None),
        }
    }

    /// Reports whether this lease has already been settled.
    pub fn is_settled(&self) -> bool {
        self.finalizer.lock().is_none()
    }

    /// Positively acknowledges the underlying delivery. The first call wins;
    /// repeated calls produce no additional broker-side effect.
    pub async fn ack(&self) {
        let finalizer = self.finalizer.lock().take();

        if let Some(finalizer) = finalizer {
            if let Err(error) = finalizer.complete().await {
                error!(
                    alert = true,
                    consumer = self.consumer.as_ref(),
                    ?error,
                    error_message = %error,
                    "Failed to acknowledge an incoming message",
                );
            }
        }
    }

    /// Negatively acknowledges the underlying delivery, requesting a requeue
    /// where the driver supports it. Suppressed if the lease has already been
    /// settled.
    pub async fn reject(&self) {
        let finalizer = self.finalizer.lock().take();

        if let Some(finalizer) = finalizer {
            if let Err(error) = finalizer.requeue().await {
                warn!(
                    alert = true,
                    consumer = self.consumer.as_ref(),
                    ?error,
                    error_message = %error,
                    "Failed to reject an incoming message",
                );
            }
        }
    }
}

impl Drop for DeliveryLease {
    fn drop(&mut self) {
        if self.finalizer.lock().is_some() {
            error!(
                alert = true,
                consumer = self.consumer.as_ref(),
                "Dropped a delivery lease without finalizing it",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFinalizer {
        completions: AtomicUsize,
        requeues: AtomicUsize,
    }

    impl CountingFinalizer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                completions: AtomicUsize::new(0),
                requeues: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Finalizer for CountingFinalizer {
        async fn complete(&self) -> Result<(), BrokerError> {
            self.completions.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        async fn requeue(&self) -> Result<(), BrokerError> {
            self.requeues.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    #[tokio::test]
    async fn double_ack_reaches_the_broker_once() {
        // Given
        let finalizer = CountingFinalizer::new();
        let lease = DeliveryLease::new("test", finalizer.clone());

        // When
        lease.ack().await;
        lease.ack().await;

        // Then
        assert_eq!(finalizer.completions.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn reject_after_ack_is_suppressed() {
        // Given
        let finalizer = CountingFinalizer::new();
        let lease = DeliveryLease::new("test", finalizer.clone());

        // When
        lease.ack().await;
        lease.reject().await;

        // Then
        assert_eq!(finalizer.completions.load(Ordering::Relaxed), 1);
        assert_eq!(finalizer.requeues.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn settled_lease_reports_settled() {
        // Given
        let lease = DeliveryLease::settled("test");

        // Then
        assert!(lease.is_settled());
    }
}
