use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// Global singleton token representing the run context
static TOKEN: OnceLock<CancellationToken> = OnceLock::new();

/// Facade representing the global (singleton) run context of the pipeline.
///
/// The context starts out alive and can be [terminated](RunContext::terminate)
/// at any point, exactly once: repeated termination produces no additional
/// effect. Termination is cooperative: nothing is forcibly stopped. Instead,
/// every long-running pipeline workload (a consumer loop, the cron driver, a
/// connection keeper) is expected to [wait](RunContext::terminated) on this
/// context and wind down once it unblocks.
///
/// It is also possible to [auto-terminate](RunContext::auto_terminate) the
/// context when an OS shutdown signal is intercepted.
pub struct RunContext;

impl RunContext {
    /// Internal chokepoint for accessing the global singleton [`TOKEN`].
    fn token() -> &'static CancellationToken {
        TOKEN.get_or_init(CancellationToken::new)
    }

    /// Blocks until the global run context is terminated.
    ///
    /// Any number of tasks may await on this method. A task that starts
    /// waiting after the context has already been terminated unblocks
    /// immediately.
    pub async fn terminated() {
        Self::token().cancelled().await;
    }

    /// Terminates the global run context, unblocking every task that
    /// [waits](RunContext::terminated) on it.
    pub fn terminate() {
        info!("Terminating the run context");

        Self::token().cancel();
    }

    /// Reports whether the global run context has been terminated as of this
    /// moment.
    pub fn is_terminated() -> bool {
        Self::token().is_cancelled()
    }

    /// Reports whether the global run context is still alive as of this
    /// moment.
    pub fn is_alive() -> bool {
        !Self::token().is_cancelled()
    }

    /// Schedules listening for OS shutdown signals. Once this method returns,
    /// the first intercepted shutdown signal [terminates](RunContext::terminate)
    /// the context instead of killing the process; the second intercepted
    /// signal exits the process forcibly.
    ///
    /// Repeated calls produce no additional effect. This method must be
    /// awaited to guarantee that listening has started by the time the
    /// returned future completes.
    pub async fn auto_terminate() {
        static CALLED: AtomicBool = AtomicBool::new(false);

        if CALLED.swap(true, Ordering::Relaxed) {
            return;
        }

        tokio::spawn(Self::listen_for_shutdown_signals());

        // Yield to the runtime so that the listener task gets to start
        tokio::task::yield_now().await;
    }

    /// Hijacks the OS shutdown signals for the lifetime of the process. The
    /// first signal terminates the run context; a repeated signal exits the
    /// process with a non-zero status code.
    async fn listen_for_shutdown_signals() -> ! {
        Self::wait_for_shutdown_signal().await;

        info!("Shutdown signal intercepted");

        Self::token().cancel();

        Self::wait_for_shutdown_signal().await;

        warn!("Repeated shutdown signal intercepted; exiting");

        std::process::exit(1);
    }

    /// Waits for the next OS shutdown signal on a Unix platform.
    #[cfg(unix)]
    async fn wait_for_shutdown_signal() {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt()).unwrap();
        let mut sigterm = signal(SignalKind::terminate()).unwrap();

        tokio::select! {
            biased; // no need to pay for randomized branch checking
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    }

    /// Waits for the next `ctrl_c` action on a non-Unix platform.
    #[cfg(not(unix))]
    async fn wait_for_shutdown_signal() {
        tokio::signal::ctrl_c().await.unwrap();
    }
}
