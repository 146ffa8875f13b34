use crate::cron::CronDriver;
use crate::error::MediatorError;
use crate::mediator::{Mediator, WorkerHandle};
use crate::waiting::probe_waiting;
use crate::worker::Worker;
use conveyor_core::{RunContext, Spindown};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// How many times a broker connection is attempted at startup before the run
/// is abandoned as unreachable.
const CONNECT_ATTEMPTS: u32 = 5;

/// The terminal outcome of a pipeline run, mapped onto the conventional exit
/// codes of pipeline host processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeOutcome {
    /// The run wound down gracefully.
    Graceful,
    /// The definitions were inconsistent with the registered workers.
    ConfigError,
    /// A broker stayed unreachable through every connection attempt.
    BrokerUnreachable,
    /// A waiting never became healthy.
    WaitingFailed,
}

impl RuntimeOutcome {
    /// Maps this outcome onto the host process exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            RuntimeOutcome::Graceful => 0,
            RuntimeOutcome::ConfigError => 1,
            RuntimeOutcome::BrokerUnreachable => 2,
            RuntimeOutcome::WaitingFailed => 3,
        }
    }
}

/// Boots a pipeline and runs it until the run context terminates.
///
/// The startup sequence is fixed: probe the waitings of the workers to run,
/// open the broker connections, start each worker (answer-topic consumer
/// before input-topic consumer), start the cron driver. Shutdown is the
/// reverse: stop fetching deliveries, drain the in-flight handlers within
/// the spindown deadline, close the brokers.
pub struct PipelineRuntime {
    mediator: Mediator,
    workers: Vec<(String, Arc<dyn Worker>)>,
}

impl PipelineRuntime {
    /// Creates a runtime over the given mediator, with no workers yet.
    pub fn new(mediator: Mediator) -> Self {
        Self {
            mediator,
            workers: Vec::new(),
        }
    }

    /// Registers the implementation of a defined worker to be run.
    pub fn with_worker(mut self, name: impl AsRef<str>, worker: Arc<dyn Worker>) -> Self {
        self.workers.push((name.as_ref().to_string(), worker));

        self
    }

    /// Runs the pipeline to completion.
    pub async fn run(self) -> RuntimeOutcome {
        let mediator = self.mediator;

        // 1. Probe the waitings referenced by the workers to run
        if let Err(error) = Self::probe_waitings(&mediator, &self.workers).await {
            error!(
                ?error,
                error_message = %error,
                "A waiting never became healthy; abandoning the run",
            );

            return RuntimeOutcome::WaitingFailed;
        }

        // 2. Open the broker connections, with bounded retries
        if let Err(error) = Self::connect_brokers(&mediator).await {
            error!(
                ?error,
                error_message = %error,
                "A broker stayed unreachable; abandoning the run",
            );

            return RuntimeOutcome::BrokerUnreachable;
        }

        // Resolve the registered workers against their definitions
        let mut staged = Vec::with_capacity(self.workers.len());
        for (name, worker) in self.workers {
            match mediator.consumable_worker(&name) {
                Ok(definition) => staged.push((definition, worker)),
                Err(error) => {
                    error!(
                        worker = name.as_str(),
                        ?error,
                        error_message = %error,
                        "Failed to start a worker; abandoning the run",
                    );

                    return RuntimeOutcome::ConfigError;
                }
            }
        }

        // 3. Start the answer-topic consumers
        let mut answer_stages = Vec::with_capacity(staged.len());
        for (definition, _) in &staged {
            answer_stages.push(mediator.start_answer_stage(definition));
        }

        // 4. Start the cron driver
        match CronDriver::new(mediator.clone()) {
            Ok(driver) if !driver.is_empty() => {
                tokio::spawn(driver.run());
            }
            Ok(_) => {}
            Err(error) => {
                error!(
                    ?error,
                    error_message = %error,
                    "Failed to build the cron driver; abandoning the run",
                );

                return RuntimeOutcome::ConfigError;
            }
        }

        // 5. Start the input-topic consumers
        let mut handles = Vec::with_capacity(staged.len());
        for ((definition, worker), answer_stage) in staged.into_iter().zip(answer_stages) {
            let input_stage = mediator.start_input_stage(&definition, worker);

            handles.push(WorkerHandle::from_stages(
                definition.name.clone(),
                answer_stage,
                input_stage,
            ));
        }

        info!("Pipeline is serving");

        // Hand the shutdown signals over to the run context and wait
        RunContext::auto_terminate().await;
        RunContext::terminated().await;

        info!("Pipeline is winding down");

        // Stop fetching deliveries and drain the in-flight handlers
        for handle in handles {
            handle.stop().await;
        }

        Spindown::completed().await;

        // Closing the brokers releases the connection-pool references
        mediator.close_brokers().await;

        RuntimeOutcome::Graceful
    }

    /// Probes every waiting referenced by the workers to run, each once.
    async fn probe_waitings(
        mediator: &Mediator,
        workers: &[(String, Arc<dyn Worker>)],
    ) -> Result<(), MediatorError> {
        let mut names = BTreeSet::new();
        for (name, _) in workers {
            if let Some(definition) = mediator.registry().worker(name) {
                names.extend(definition.waitings.iter().cloned());
            }
        }

        for name in names {
            let definition =
                mediator
                    .registry()
                    .waiting(&name)
                    .ok_or_else(|| MediatorError::ConfigInvalid {
                        reason: format!("unknown waiting '{}'", name),
                    })?;

            probe_waiting(definition).await?;
        }

        Ok(())
    }

    /// Opens the broker connections, retrying each failure with the spacing
    /// the brokers are configured with.
    async fn connect_brokers(mediator: &Mediator) -> Result<(), MediatorError> {
        let retry_delay = mediator
            .registry()
            .brokers()
            .map(|broker| broker.retry_delay_s)
            .max()
            .unwrap_or(3);

        let mut last_error = None;

        for attempt in 1..=CONNECT_ATTEMPTS {
            match mediator.connect_brokers().await {
                Ok(()) => return Ok(()),
                Err(error) => {
                    warn!(
                        attempt,
                        attempts = CONNECT_ATTEMPTS,
                        ?error,
                        error_message = %error,
                        "Failed to open the broker connections",
                    );

                    last_error = Some(error);

                    if attempt < CONNECT_ATTEMPTS {
                        sleep(Duration::from_secs(retry_delay)).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or(MediatorError::ConfigInvalid {
            reason: "no broker connection attempt was made".to_string(),
        }))
    }
}
