mod common;

use async_trait::async_trait;
use conveyor::{ConsumerManager, Envelope, MediatorError, Worker, WorkerFault};
use conveyor_codec::{CodecDescriptor, CodecRegistry};
use conveyor_transport::{Broker, BrokerCodec, MemoryBroker};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
struct EchoWorker {
    invocations: AtomicUsize,
}

#[async_trait]
impl Worker for EchoWorker {
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

#[tokio::test]
async fn an_invalid_payload_is_refused_before_the_wire() {
    // Given
    let mediator = common::echo_mediator();
    let worker = Arc::new(EchoWorker::default());
    let handle = mediator.start_worker("echo", worker.clone()).await.unwrap();

    // When: the value is an integer where the schema wants a string
    let result = mediator.send("echo", json!({"value": 123})).await;

    // Then: the caller sees a publish failure
    assert!(matches!(result, Err(MediatorError::PublishFailed { .. })));

    // Then: an error envelope landed on the error topic instead
    common::eventually(
        || mediator.memory_exchange().depth(mediator.error_topic()) == 1,
        "the error envelope to land on the error topic",
    )
    .await;

    // Then: nothing reached the worker
    assert_eq!(mediator.memory_exchange().depth("echo"), 0);
    assert_eq!(worker.invocations.load(Ordering::Relaxed), 0);

    handle.stop().await;
}

#[tokio::test]
async fn a_poison_delivery_is_settled_without_invoking_the_handler() {
    // Given
    let mediator = common::echo_mediator();
    let worker = Arc::new(EchoWorker::default());
    let handle = mediator.start_worker("echo", worker.clone()).await.unwrap();

    // Given: a side door onto the same exchange, bypassing send-side
    // validation the way a foreign producer would
    let side_door = MemoryBroker::new(
        "side-door",
        BrokerCodec::new(CodecRegistry::global(), &CodecDescriptor::default()).unwrap(),
        mediator.memory_exchange().clone(),
    );
    let poison = Envelope::with_payload(json!({"value": 123})).build().unwrap();

    // When
    side_door.publish("echo", &poison).await.unwrap();

    // Then: the delivery is settled with an error envelope, handler untouched
    common::eventually(
        || mediator.memory_exchange().depth(mediator.error_topic()) == 1,
        "the error envelope to land on the error topic",
    )
    .await;
    common::eventually(
        || mediator.memory_exchange().depth("echo") == 0,
        "the poison delivery to be settled",
    )
    .await;
    assert_eq!(worker.invocations.load(Ordering::Relaxed), 0);

    handle.stop().await;
}
