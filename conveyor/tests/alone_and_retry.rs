mod common;

use async_trait::async_trait;
use conveyor::{ConsumerManager, Envelope, Mediator, SendOptions, Worker, WorkerFault};
use conveyor::{CodecRegistry, DefinitionRegistry};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A mediator with a single always-failing worker with a small retry budget.
fn flaky_mediator(max_retries: u32) -> Mediator {
    let mut registry = DefinitionRegistry::new();

    registry.add_broker(common::memory_broker("mem")).unwrap();
    registry
        .add_message(common::message("job", json!(true)))
        .unwrap();

    let mut flaky = common::worker("flaky", "mem", "job");
    flaky.max_retries = max_retries;
    registry.add_worker(flaky).unwrap();

    Mediator::assemble(registry, CodecRegistry::global()).unwrap()
}

#[derive(Default)]
struct FailingWorker {
    invocations: AtomicUsize,
}

#[async_trait]
impl Worker for FailingWorker {
    async fn handle(
        &self,
        _envelope: &Envelope,
        _manager: &ConsumerManager,
    ) -> Result<Option<Value>, WorkerFault> {
        self.invocations.fetch_add(1, Ordering::Relaxed);

        Err(WorkerFault::new("this worker always fails"))
    }
}

#[tokio::test]
async fn a_failing_delivery_is_requeued_then_settled_with_an_error_envelope() {
    // Given
    let mediator = flaky_mediator(2);
    let worker = Arc::new(FailingWorker::default());
    let handle = mediator.start_worker("flaky", worker.clone()).await.unwrap();

    // When
    mediator.send("flaky", json!({"job": 1})).await.unwrap();

    // Then: the handler ran on the initial delivery and on every requeue
    common::eventually(
        || worker.invocations.load(Ordering::Relaxed) == 3,
        "the retry budget to be exhausted",
    )
    .await;

    // Then: the delivery is settled with an error envelope on the error topic
    common::eventually(
        || mediator.memory_exchange().depth(mediator.error_topic()) == 1,
        "the error envelope to land on the error topic",
    )
    .await;
    common::eventually(
        || mediator.memory_exchange().depth("flaky") == 0,
        "the failing delivery to be settled",
    )
    .await;
    assert_eq!(worker.invocations.load(Ordering::Relaxed), 3);

    handle.stop().await;
}

#[tokio::test]
async fn alone_sends_are_suppressed_until_the_predecessor_settles() {
    // Given: no consumer is running yet
    let mediator = common::echo_mediator();
    let alone = SendOptions::new().alone();

    // When: the same payload is sent alone twice
    mediator
        .send_with("echo", json!({"value": "tick"}), alone.clone())
        .await
        .unwrap();
    mediator
        .send_with("echo", json!({"value": "tick"}), alone.clone())
        .await
        .unwrap();

    // Then: only the first made it onto the queue
    assert_eq!(mediator.memory_exchange().depth("echo"), 1);

    // When: a consumer settles the predecessor
    let worker = Arc::new(AckingWorker::default());
    let handle = mediator.start_worker("echo", worker.clone()).await.unwrap();
    common::eventually(
        || worker.invocations.load(Ordering::Relaxed) == 1,
        "the predecessor to be handled",
    )
    .await;

    // Then: the next alone send goes through
    mediator
        .send_with("echo", json!({"value": "tick"}), alone)
        .await
        .unwrap();
    common::eventually(
        || worker.invocations.load(Ordering::Relaxed) == 2,
        "the follow-up message to be handled",
    )
    .await;

    handle.stop().await;
}

#[derive(Default)]
struct AckingWorker {
    invocations: AtomicUsize,
}

#[async_trait]
impl Worker for AckingWorker {
    async fn handle(
        &self,
        _envelope: &Envelope,
        manager: &ConsumerManager,
    ) -> Result<Option<Value>, WorkerFault> {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        manager.ack().await;

        Ok(None)
    }
}
