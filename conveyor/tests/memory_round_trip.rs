mod common;

use async_trait::async_trait;
use conveyor::{ConsumerManager, Envelope, Worker, WorkerFault};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
struct EchoWorker {
    invocations: AtomicUsize,
    last_value: parking_lot::Mutex<Option<Value>>,
}

#[async_trait]
impl Worker for EchoWorker {
    async fn handle(
        &self,
        envelope: &Envelope,
        manager: &ConsumerManager,
    ) -> Result<Option<Value>, WorkerFault> {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        *self.last_value.lock() = Some(envelope.payload().clone());

        manager.ack().await;

        Ok(None)
    }
}

#[tokio::test]
async fn publish_is_handled_once_and_the_queue_drains() {
    // Given
    let mediator = common::echo_mediator();
    let worker = Arc::new(EchoWorker::default());
    let handle = mediator.start_worker("echo", worker.clone()).await.unwrap();

    // When
    mediator.send("echo", json!({"value": "hi"})).await.unwrap();

    // Then: the handler was invoked exactly once with the payload
    common::eventually(
        || worker.invocations.load(Ordering::Relaxed) == 1,
        "the echo handler to be invoked",
    )
    .await;
    assert_eq!(*worker.last_value.lock(), Some(json!({"value": "hi"})));

    // Then: the delivery is settled and the queue is empty
    common::eventually(
        || mediator.memory_exchange().depth("echo") == 0,
        "the echo queue to drain",
    )
    .await;

    handle.stop().await;
    assert_eq!(worker.invocations.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn sends_to_unknown_workers_are_refused() {
    // Given
    let mediator = common::echo_mediator();

    // When
    let result = mediator.send("nobody", json!({"value": "hi"})).await;

    // Then
    assert!(matches!(
        result,
        Err(conveyor::MediatorError::UnknownWorker(_)),
    ));
}
