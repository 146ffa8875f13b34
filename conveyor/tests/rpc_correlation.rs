mod common;

use async_trait::async_trait;
use conveyor::{
    CodecRegistry, ConsumerManager, DefinitionRegistry, Envelope, Mediator, MediatorError, Worker,
    WorkerFault,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Builds a mediator with a caller worker and a responder worker on one
/// memory broker. The caller's answer deadline is tightened for the timeout
/// scenario.
fn rpc_mediator(rpc_timeout_s: u64) -> Mediator {
    let mut registry = DefinitionRegistry::new();

    registry.add_broker(common::memory_broker("mem")).unwrap();
    registry
        .add_message(common::message("kick", json!(true)))
        .unwrap();
    registry
        .add_message(common::message(
            "question",
            json!({
                "type": "object",
                "properties": {"x": {"type": "integer"}},
                "required": ["x"],
            }),
        ))
        .unwrap();
    registry
        .add_message(common::message(
            "reply",
            json!({
                "type": "object",
                "properties": {"y": {"type": "integer"}},
                "required": ["y"],
            }),
        ))
        .unwrap();

    let mut caller = common::worker("caller", "mem", "kick");
    caller.rpc_timeout_s = rpc_timeout_s;
    registry.add_worker(caller).unwrap();

    let mut responder = common::worker("responder", "mem", "question");
    responder.output_message = Some("reply".to_string());
    registry.add_worker(responder).unwrap();

    Mediator::assemble(registry, CodecRegistry::global()).unwrap()
}

/// Asks the responder for an answer and records the outcome.
#[derive(Default)]
struct CallerWorker {
    outcome: Mutex<Option<Result<Value, String>>>,
}

#[async_trait]
impl Worker for CallerWorker {
    async fn handle(
        &self,
        _envelope: &Envelope,
        manager: &ConsumerManager,
    ) -> Result<Option<Value>, WorkerFault> {
        let answer = manager.get_answer_from("responder", json!({"x": 2})).await;

        *self.outcome.lock() = Some(match answer {
            Ok(envelope) => Ok(envelope.payload().clone()),
            Err(error) => Err(error.to_string()),
        });

        Ok(None)
    }
}

/// Doubles the incoming `x` into `y`.
struct ResponderWorker;

#[async_trait]
impl Worker for ResponderWorker {
    async fn handle(
        &self,
        envelope: &Envelope,
        _manager: &ConsumerManager,
    ) -> Result<Option<Value>, WorkerFault> {
        let x = envelope.payload()["x"]
            .as_i64()
            .ok_or_else(|| WorkerFault::new("no x"))?;

        Ok(Some(json!({"y": x * 2})))
    }
}

#[tokio::test]
async fn a_blocked_caller_receives_the_matching_answer() {
    // Given
    let mediator = rpc_mediator(30);
    let caller = Arc::new(CallerWorker::default());
    let caller_handle = mediator.start_worker("caller", caller.clone()).await.unwrap();
    let responder_handle = mediator
        .start_worker("responder", Arc::new(ResponderWorker))
        .await
        .unwrap();

    // When
    mediator.send("caller", json!({})).await.unwrap();

    // Then: the caller unblocked with the responder's payload
    common::eventually(|| caller.outcome.lock().is_some(), "the caller to unblock").await;
    assert_eq!(caller.outcome.lock().clone(), Some(Ok(json!({"y": 4}))));

    // Then: no waiter is left behind
    assert_eq!(mediator.pending_answer_count(), 0);

    caller_handle.stop().await;
    responder_handle.stop().await;
}

#[tokio::test]
async fn a_silent_responder_times_the_caller_out() {
    // Given: the responder is defined but never started
    let mediator = rpc_mediator(1);
    let caller = Arc::new(CallerWorker::default());
    let caller_handle = mediator.start_worker("caller", caller.clone()).await.unwrap();

    // When
    let asked_at = Instant::now();
    mediator.send("caller", json!({})).await.unwrap();

    // Then: the deadline, not the answer, unblocks the caller
    common::eventually(|| caller.outcome.lock().is_some(), "the caller to unblock").await;
    let outcome = caller.outcome.lock().clone().unwrap();
    assert!(outcome.is_err(), "expected a timeout, got {:?}", outcome);
    assert!(asked_at.elapsed() >= Duration::from_secs(1));

    // Then: the timed-out waiter left the table
    assert_eq!(mediator.pending_answer_count(), 0);

    caller_handle.stop().await;
}

#[tokio::test]
async fn nested_answer_requests_are_forbidden() {
    // Given: a caller that asks twice concurrently... from the same manager
    struct NestedCaller {
        second_outcome: Mutex<Option<String>>,
    }

    #[async_trait]
    impl Worker for NestedCaller {
        async fn handle(
            &self,
            _envelope: &Envelope,
            manager: &ConsumerManager,
        ) -> Result<Option<Value>, WorkerFault> {
            // The first request is left pending while the second is issued
            let first = manager.get_answer_from("responder", json!({"x": 1}));
            let second = manager.get_answer_from("responder", json!({"x": 2}));

            let (_, second_result) = tokio::join!(first, second);

            *self.second_outcome.lock() = Some(match second_result {
                Ok(_) => "answered".to_string(),
                Err(error) => error.to_string(),
            });

            Ok(None)
        }
    }

    let mediator = rpc_mediator(1);
    let caller = Arc::new(NestedCaller {
        second_outcome: Mutex::new(None),
    });
    let caller_handle = mediator.start_worker("caller", caller.clone()).await.unwrap();

    // When
    mediator.send("caller", json!({})).await.unwrap();

    // Then
    common::eventually(
        || caller.second_outcome.lock().is_some(),
        "the nested request to resolve",
    )
    .await;
    assert_eq!(
        caller.second_outcome.lock().clone().unwrap(),
        MediatorError::RpcNested.to_string(),
    );

    caller_handle.stop().await;
}
