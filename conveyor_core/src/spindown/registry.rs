use crate::SpindownToken;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use parking_lot::Mutex;
use scopeguard::defer;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

// Global singleton spindown registry
static GLOBAL: OnceLock<SpindownRegistry> = OnceLock::new();

// Spindown timeout (stored statically to allow customizing)
const DEFAULT_TIMEOUT_SECS: u64 = 2;
static TIMEOUT_SECS: Mutex<u64> = Mutex::new(DEFAULT_TIMEOUT_SECS);

/// Facade for the pipeline's global spindown registry.
///
/// Long-lived background workloads (broker connection keepers, consumer
/// loops, the cron driver) [register](Spindown::register) themselves here and
/// receive a [`SpindownToken`]. When the run context is terminated, the host
/// [waits](Spindown::completed) for every registered workload to punch its
/// token out, within a configurable timeout. Workloads that miss the deadline
/// are reported and abandoned.
pub struct Spindown;

impl Spindown {
    /// Registers a workload under the given human-readable name (which need
    /// not be unique) and returns the token that the workload must punch out
    /// upon graceful completion.
    pub fn register(name: impl AsRef<str>) -> SpindownToken {
        Self::global_registry().register(name.as_ref())
    }

    /// Customizes the spindown timeout. Must be called before the first
    /// interaction with the registry; later calls have no effect.
    pub fn set_timeout_secs(timeout_secs: impl Into<u64>) {
        *TIMEOUT_SECS.lock() = timeout_secs.into();
    }

    /// Waits for all registered workloads to punch out, within the timeout.
    ///
    /// Workloads that register while previous ones are being awaited are
    /// picked up in a follow-up cycle under the same shared timeout. This
    /// method does not itself signal the workloads to wind down; that is the
    /// job of [`RunContext`](crate::RunContext).
    pub async fn completed() {
        Self::global_registry().spun_down().await;
    }

    /// Retrieves the global (singleton) registry, lazily initialized.
    fn global_registry() -> &'static SpindownRegistry {
        GLOBAL.get_or_init(|| SpindownRegistry::new(Duration::from_secs(*TIMEOUT_SECS.lock())))
    }
}

/// Thread-safe growable storage of registered workloads with the ability to
/// await their collective completion.
struct SpindownRegistry {
    workloads: Mutex<Vec<(Arc<str>, CancellationToken)>>,
    timeout: Duration,
}

impl SpindownRegistry {
    fn new(timeout: Duration) -> Self {
        Self {
            workloads: Mutex::new(Vec::new()),
            timeout,
        }
    }

    fn register(&self, name: &str) -> SpindownToken {
        let token = CancellationToken::new();

        self.workloads.lock().push((Arc::from(name), token.clone()));

        SpindownToken::new(token)
    }

    /// Repeatedly drains the registry and awaits every drained workload until
    /// either the registry stays empty or the shared timeout runs out.
    async fn spun_down(&self) {
        info!("Spindown initiated");

        // Shared deadline across all spindown cycles
        let deadline = CancellationToken::new();
        let deadline_trigger = deadline.clone();
        let timeout = self.timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            deadline_trigger.cancel();
        });

        defer! { timer.abort() }

        loop {
            // Take the currently registered workloads, leaving an empty vector
            let workloads = std::mem::take(&mut *self.workloads.lock());

            if workloads.is_empty() {
                info!("Spindown completed");
                return;
            }

            info!(
                "Waiting for {} registered workload(s) to complete",
                workloads.len(),
            );

            if !Self::spin_down_once(workloads, &deadline).await {
                return;
            }
        }
    }

    /// Awaits a single batch of workloads. Reports whether the batch
    /// completed before the deadline.
    async fn spin_down_once(
        workloads: Vec<(Arc<str>, CancellationToken)>,
        deadline: &CancellationToken,
    ) -> bool {
        let mut punched_out = workloads
            .into_iter()
            .map(|(name, token)| async move {
                token.cancelled().await;
                name
            })
            .collect::<FuturesUnordered<_>>();

        loop {
            let completed_workload = select! {
                biased;
                _ = deadline.cancelled() => None,
                workload = punched_out.next() => workload,
            };

            match completed_workload {
                Some(workload) => {
                    info!(workload = workload.as_ref(), "Completed gracefully");

                    if punched_out.is_empty() {
                        return true;
                    }
                }
                None => {
                    error!(
                        remaining = punched_out.len(),
                        "Some workloads did not complete gracefully within the spindown timeout",
                    );

                    return false;
                }
            }
        }
    }
}
