use crate::definition::cron::CronTaskDefinition;
use crate::error::MediatorError;
use crate::mediator::{Mediator, SendOptions};
use chrono::{DateTime, Utc};
use conveyor_core::{RunContext, Spindown};
use cron::Schedule;
use std::str::FromStr;
use std::time::Duration;
use tokio::select;
use tracing::{debug, info, warn};

/// Fires the synthetic messages of the registered cron tasks at the minute
/// boundary, without drift.
///
/// On start, every task's next firing instant is computed from the wall
/// clock. The driver sleeps until the earliest of them, fires every task
/// that is due, and recomputes each fired task's next instant strictly after
/// the one that just fired — which is what rules out both drift and a double
/// fire within the same matching minute.
pub struct CronDriver {
    mediator: Mediator,
    entries: Vec<CronEntry>,
}

/// One scheduled task with its parsed schedule and next firing instant.
struct CronEntry {
    definition: CronTaskDefinition,
    schedule: Schedule,
    next: Option<DateTime<Utc>>,
}

impl CronDriver {
    /// Builds the driver from the cron tasks of the given mediator,
    /// computing every task's first firing instant from the current wall
    /// clock.
    pub fn new(mediator: Mediator) -> Result<Self, MediatorError> {
        let now = Utc::now();

        let entries = mediator
            .registry()
            .cron_tasks()
            .map(|definition| {
                let schedule = parse_cron_expression(&definition.name, &definition.when)?;
                let next = schedule.after(&now).next();

                Ok(CronEntry {
                    definition: definition.clone(),
                    schedule,
                    next,
                })
            })
            .collect::<Result<Vec<_>, MediatorError>>()?;

        Ok(Self { mediator, entries })
    }

    /// Reports whether this driver has any tasks to fire.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Runs the firing loop until the run context is terminated.
    pub async fn run(mut self) {
        let _token = Spindown::register("conveyor:cron");
        let mediator = self.mediator.clone();

        info!(task_count = self.entries.len(), "Cron driver started");

        loop {
            // Sleep until the earliest next-fire instant
            let Some(soonest) = self.entries.iter().filter_map(|entry| entry.next).min() else {
                info!("No cron task has a next firing instant; cron driver stopping");

                return;
            };

            let delay = (soonest - Utc::now()).to_std().unwrap_or(Duration::ZERO);

            select! {
                biased;
                _ = RunContext::terminated() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            // Fire every task that is due
            let now = Utc::now();

            for entry in &mut self.entries {
                let Some(next) = entry.next else { continue };

                if next > now {
                    continue;
                }

                debug!(
                    task = entry.definition.name.as_str(),
                    worker = entry.definition.worker.as_str(),
                    fired_at = %next,
                    "Firing a cron task",
                );

                let options = match entry.definition.alone {
                    true => SendOptions::new().alone(),
                    false => SendOptions::new(),
                };

                let sent = mediator
                    .send_with(
                        &entry.definition.worker,
                        entry.definition.synthetic_payload(),
                        options,
                    )
                    .await;

                if let Err(error) = sent {
                    warn!(
                        alert = true,
                        task = entry.definition.name.as_str(),
                        worker = entry.definition.worker.as_str(),
                        ?error,
                        error_message = %error,
                        "Failed to fire a cron task",
                    );
                }

                // Strictly after the fired instant: no drift, no double fire
                entry.next = entry.schedule.after(&next).next();
            }
        }
    }
}

/// Parses a 5-field cron expression by pinning the seconds field to zero,
/// which is also what aligns every firing to the minute boundary.
fn parse_cron_expression(task: &str, expression: &str) -> Result<Schedule, MediatorError> {
    let with_seconds = format!("0 {}", expression.trim());

    Schedule::from_str(&with_seconds).map_err(|error| MediatorError::ConfigInvalid {
        reason: format!(
            "cron task '{}' carries an invalid expression '{}': {}",
            task, expression, error,
        ),
    })
}
