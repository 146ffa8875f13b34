mod common;

use async_trait::async_trait;
use conveyor::{
    ConsumerManager, Envelope, PipelineRuntime, RunContext, RuntimeOutcome, Worker, WorkerFault,
};
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

// This test terminates the process-wide run context, so it lives alone in
// its own integration test binary.
#[tokio::test]
async fn the_runtime_serves_and_winds_down_gracefully() {
    // Given
    let mediator = common::echo_mediator();
    let worker = Arc::new(EchoWorker::default());
    let runtime = PipelineRuntime::new(mediator.clone()).with_worker("echo", worker.clone());
    let run = tokio::spawn(runtime.run());

    // When: the pipeline serves a message
    mediator.send("echo", json!({"value": "hi"})).await.unwrap();
    common::eventually(
        || worker.invocations.load(Ordering::Relaxed) == 1,
        "the echo handler to be invoked",
    )
    .await;

    // When: the run context is terminated
    RunContext::terminate();

    // Then
    let outcome = run.await.unwrap();
    assert_eq!(outcome, RuntimeOutcome::Graceful);
    assert_eq!(outcome.exit_code(), 0);
}
