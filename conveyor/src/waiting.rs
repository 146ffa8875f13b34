use crate::definition::waiting::WaitingDefinition;
use crate::error::MediatorError;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info};

/// Probes the given waiting until it accepts a TCP connection, or until its
/// timeout runs out with [`MediatorError::WaitingTimeout`].
pub async fn probe_waiting(definition: &WaitingDefinition) -> Result<(), MediatorError> {
    let address = format!("{}:{}", definition.host, definition.port);
    let deadline = Instant::now() + Duration::from_secs(definition.timeout_s);
    let retry_delay = Duration::from_secs(definition.retry_delay_s.max(1));

    loop {
        let attempt = timeout(retry_delay, TcpStream::connect(address.as_str())).await;

        match attempt {
            Ok(Ok(_stream)) => {
                info!(
                    waiting = definition.name.as_str(),
                    address = address.as_str(),
                    "Waiting is healthy",
                );

                return Ok(());
            }
            Ok(Err(error)) => {
                debug!(
                    waiting = definition.name.as_str(),
                    address = address.as_str(),
                    ?error,
                    "Waiting probe refused",
                );
            }
            Err(_elapsed) => {
                debug!(
                    waiting = definition.name.as_str(),
                    address = address.as_str(),
                    "Waiting probe timed out",
                );
            }
        }

        if Instant::now() + retry_delay >= deadline {
            return Err(MediatorError::WaitingTimeout {
                name: definition.name.clone(),
                timeout_s: definition.timeout_s,
            });
        }

        sleep(retry_delay).await;
    }
}
