use crate::definition::broker::BrokerDefinition;
use crate::definition::cron::CronTaskDefinition;
use crate::definition::message::MessageDefinition;
use crate::definition::waiting::WaitingDefinition;
use crate::definition::worker::WorkerDefinition;
use crate::error::MediatorError;
use jsonschema::Validator;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A message definition together with its compiled payload validator.
pub struct CompiledMessage {
    definition: MessageDefinition,
    validator: Validator,
}

impl CompiledMessage {
    /// Compiles the schema of the given definition.
    fn compile(definition: MessageDefinition) -> Result<Self, MediatorError> {
        let validator = jsonschema::validator_for(&definition.schema).map_err(|error| {
            MediatorError::ConfigInvalid {
                reason: format!(
                    "message '{}' carries an invalid schema: {}",
                    definition.name, error,
                ),
            }
        })?;

        Ok(Self {
            definition,
            validator,
        })
    }

    /// Reports the name of the underlying message.
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Validates the given payload against this message's schema, reporting
    /// the first violation.
    pub fn validate(&self, payload: &Value) -> Result<(), String> {
        self.validator
            .validate(payload)
            .map_err(|error| error.to_string())
    }
}

/// Holds the validated, immutable definitions that a
/// [`Mediator`](crate::Mediator) is assembled from.
///
/// Definitions are keyed by name within their section; registering a name
/// twice fails with [`MediatorError::DefinitionDuplicate`]. Cross-references
/// (a worker's broker, messages, and waitings; a cron task's worker) are
/// checked by [`validate`](DefinitionRegistry::validate), which the mediator
/// runs at assembly time.
#[derive(Default)]
pub struct DefinitionRegistry {
    brokers: HashMap<String, BrokerDefinition>,
    messages: HashMap<String, Arc<CompiledMessage>>,
    workers: HashMap<String, WorkerDefinition>,
    cron_tasks: HashMap<String, CronTaskDefinition>,
    waitings: HashMap<String, WaitingDefinition>,
}

impl DefinitionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a broker definition.
    pub fn add_broker(&mut self, definition: BrokerDefinition) -> Result<(), MediatorError> {
        if self.brokers.contains_key(&definition.name) {
            return Err(MediatorError::DefinitionDuplicate {
                kind: "broker",
                name: definition.name,
            });
        }

        self.brokers.insert(definition.name.clone(), definition);

        Ok(())
    }

    /// Registers a message definition, compiling its schema.
    pub fn add_message(&mut self, definition: MessageDefinition) -> Result<(), MediatorError> {
        if self.messages.contains_key(&definition.name) {
            return Err(MediatorError::DefinitionDuplicate {
                kind: "message",
                name: definition.name,
            });
        }

        let compiled = CompiledMessage::compile(definition)?;

        self.messages
            .insert(compiled.name().to_string(), Arc::new(compiled));

        Ok(())
    }

    /// Registers a worker definition.
    pub fn add_worker(&mut self, definition: WorkerDefinition) -> Result<(), MediatorError> {
        if self.workers.contains_key(&definition.name) {
            return Err(MediatorError::DefinitionDuplicate {
                kind: "worker",
                name: definition.name,
            });
        }

        self.workers.insert(definition.name.clone(), definition);

        Ok(())
    }

    /// Registers a cron task definition.
    pub fn add_cron_task(&mut self, definition: CronTaskDefinition) -> Result<(), MediatorError> {
        if self.cron_tasks.contains_key(&definition.name) {
            return Err(MediatorError::DefinitionDuplicate {
                kind: "cron",
                name: definition.name,
            });
        }

        self.cron_tasks.insert(definition.name.clone(), definition);

        Ok(())
    }

    /// Registers a waiting definition.
    pub fn add_waiting(&mut self, definition: WaitingDefinition) -> Result<(), MediatorError> {
        if self.waitings.contains_key(&definition.name) {
            return Err(MediatorError::DefinitionDuplicate {
                kind: "waiting",
                name: definition.name,
            });
        }

        self.waitings.insert(definition.name.clone(), definition);

        Ok(())
    }
}

impl DefinitionRegistry {
    /// Looks up a broker definition.
    pub fn broker(&self, name: &str) -> Option<&BrokerDefinition> {
        self.brokers.get(name)
    }

    /// Looks up a compiled message.
    pub fn message(&self, name: &str) -> Option<&Arc<CompiledMessage>> {
        self.messages.get(name)
    }

    /// Looks up a worker definition.
    pub fn worker(&self, name: &str) -> Option<&WorkerDefinition> {
        self.workers.get(name)
    }

    /// Looks up a waiting definition.
    pub fn waiting(&self, name: &str) -> Option<&WaitingDefinition> {
        self.waitings.get(name)
    }

    /// Iterates over all broker definitions.
    pub fn brokers(&self) -> impl Iterator<Item = &BrokerDefinition> {
        self.brokers.values()
    }

    /// Iterates over all worker definitions.
    pub fn workers(&self) -> impl Iterator<Item = &WorkerDefinition> {
        self.workers.values()
    }

    /// Iterates over all cron task definitions.
    pub fn cron_tasks(&self) -> impl Iterator<Item = &CronTaskDefinition> {
        self.cron_tasks.values()
    }

    /// Checks every cross-reference between the registered sections.
    pub fn validate(&self) -> Result<(), MediatorError> {
        for worker in self.workers.values() {
            if !self.brokers.contains_key(&worker.broker) {
                return Err(self.dangling("worker", &worker.name, "broker", &worker.broker));
            }

            if !self.messages.contains_key(&worker.input_message) {
                return Err(self.dangling(
                    "worker",
                    &worker.name,
                    "input message",
                    &worker.input_message,
                ));
            }

            if let Some(output_message) = &worker.output_message {
                if !self.messages.contains_key(output_message) {
                    return Err(self.dangling(
                        "worker",
                        &worker.name,
                        "output message",
                        output_message,
                    ));
                }
            }

            for waiting in &worker.waitings {
                if !self.waitings.contains_key(waiting) {
                    return Err(self.dangling("worker", &worker.name, "waiting", waiting));
                }
            }
        }

        for cron_task in self.cron_tasks.values() {
            if !self.workers.contains_key(&cron_task.worker) {
                return Err(self.dangling("cron task", &cron_task.name, "worker", &cron_task.worker));
            }
        }

        Ok(())
    }

    /// Shorthand for a dangling-reference [`MediatorError::ConfigInvalid`].
    fn dangling(
        &self,
        kind: &str,
        name: &str,
        reference_kind: &str,
        reference: &str,
    ) -> MediatorError {
        MediatorError::ConfigInvalid {
            reason: format!(
                "{} '{}' references unknown {} '{}'",
                kind, name, reference_kind, reference,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::broker::BrokerDriver;
    use conveyor_codec::CodecDescriptor;
    use serde_json::json;

    fn broker(name: &str) -> BrokerDefinition {
        BrokerDefinition {
            name: name.to_string(),
            driver: BrokerDriver::Memory,
            codec: CodecDescriptor::default(),
            retry_delay_s: 3,
            dynamic_props: Value::Null,
        }
    }

    fn message(name: &str) -> MessageDefinition {
        MessageDefinition {
            name: name.to_string(),
            schema: json!({"type": "object"}),
        }
    }

    fn worker(name: &str, broker: &str, input_message: &str) -> WorkerDefinition {
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

    #[test]
    fn duplicate_names_are_rejected() {
        // Given
        let mut registry = DefinitionRegistry::new();
        registry.add_broker(broker("main")).unwrap();

        // When
        let result = registry.add_broker(broker("main"));

        // Then
        assert!(matches!(
            result,
            Err(MediatorError::DefinitionDuplicate { kind: "broker", .. }),
        ));
    }

    #[test]
    fn dangling_worker_references_fail_validation() {
        // Given
        let mut registry = DefinitionRegistry::new();
        registry.add_broker(broker("main")).unwrap();
        registry.add_message(message("ping")).unwrap();
        registry.add_worker(worker("echo", "main", "pong")).unwrap();

        // When
        let result = registry.validate();

        // Then
        assert!(matches!(result, Err(MediatorError::ConfigInvalid { .. })));
    }

    #[test]
    fn consistent_definitions_validate() {
        // Given
        let mut registry = DefinitionRegistry::new();
        registry.add_broker(broker("main")).unwrap();
        registry.add_message(message("ping")).unwrap();
        registry.add_worker(worker("echo", "main", "ping")).unwrap();

        // Then
        assert!(registry.validate().is_ok());
    }

    #[test]
    fn invalid_schemas_fail_at_registration() {
        // Given
        let mut registry = DefinitionRegistry::new();
        let definition = MessageDefinition {
            name: "broken".to_string(),
            schema: json!({"type": "no-such-type"}),
        };

        // When
        let result = registry.add_message(definition);

        // Then
        assert!(matches!(result, Err(MediatorError::ConfigInvalid { .. })));
    }

    #[test]
    fn compiled_messages_validate_payloads() {
        // Given
        let mut registry = DefinitionRegistry::new();
        registry
            .add_message(MessageDefinition {
                name: "echo_message".to_string(),
                schema: json!({
                    "type": "object",
                    "properties": {"value": {"type": "string"}},
                    "required": ["value"],
                }),
            })
            .unwrap();
        let compiled = registry.message("echo_message").unwrap();

        // Then
        assert!(compiled.validate(&json!({"value": "hi"})).is_ok());
        assert!(compiled.validate(&json!({"value": 123})).is_err());
    }
}
