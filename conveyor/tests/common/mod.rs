#![allow(dead_code)]

use conveyor::{
    BrokerDefinition, BrokerDriver, CodecDescriptor, CodecRegistry, DefinitionRegistry, Mediator,
    MessageDefinition, WorkerDefinition,
};
use serde_json::{Value, json};
use std::time::{Duration, Instant};

/// A memory broker definition with a short retry delay.
pub fn memory_broker(name: &str) -> BrokerDefinition {
    BrokerDefinition {
        name: name.to_string(),
        driver: BrokerDriver::Memory,
        codec: CodecDescriptor::default(),
        retry_delay_s: 1,
        dynamic_props: Value::Null,
    }
}

/// A message definition with the given schema.
pub fn message(name: &str, schema: Value) -> MessageDefinition {
    MessageDefinition {
        name: name.to_string(),
        schema,
    }
}

/// A worker definition with the defaults of the declarative form.
pub fn worker(name: &str, broker: &str, input_message: &str) -> WorkerDefinition {
    WorkerDefinition {
        name: name.to_string(),
        broker: broker.to_string(),
        topic: None,
        input_message: input_message.to_string(),
        output_message: None,
        prefetch: 1,
        answer_topic: None,
        external: false,
        waitings: vec![],
        max_retries: 3,
        rpc_timeout_s: 30,
    }
}

/// A mediator with one memory broker `mem` and one worker `echo` consuming
/// `{value: string}` messages.
pub fn echo_mediator() -> Mediator {
    let mut registry = DefinitionRegistry::new();

    registry.add_broker(memory_broker("mem")).unwrap();
    registry
        .add_message(message(
            "echo_message",
            json!({
                "type": "object",
                "properties": {"value": {"type": "string"}},
                "required": ["value"],
            }),
        ))
        .unwrap();
    registry
        .add_worker(worker("echo", "mem", "echo_message"))
        .unwrap();

    Mediator::assemble(registry, CodecRegistry::global()).unwrap()
}

/// Polls the given condition until it holds, or panics after five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);

    while Instant::now() < deadline {
        if condition() {
            return;
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("timed out waiting for {}", what);
}
