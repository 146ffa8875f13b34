use serde::Deserialize;

/// Declares one worker: a named consumer bound to one input topic, an input
/// message schema, and optionally an output message schema for answering.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WorkerDefinition {
    /// The unique logical name of this worker.
    pub name: String,
    /// The name of the broker this worker's topics live on.
    pub broker: String,
    /// The input topic (defaults to the worker name).
    #[serde(default)]
    pub topic: Option<String>,
    /// The name of the message this worker consumes.
    pub input_message: String,
    /// The name of the message this worker produces, if it answers.
    #[serde(default)]
    pub output_message: Option<String>,
    /// How many unacknowledged deliveries the broker may have in flight.
    #[serde(default = "default_prefetch")]
    pub prefetch: u16,
    /// The topic carrying answers back to this worker (defaults to a topic
    /// derived from the input topic and the worker name).
    #[serde(default)]
    pub answer_topic: Option<String>,
    /// Whether this worker is external: emitted to only, never consumed
    /// locally.
    #[serde(default)]
    pub external: bool,
    /// The waitings to probe before this worker starts consuming.
    #[serde(default)]
    pub waitings: Vec<String>,
    /// How many times a failing delivery is requeued before it is settled
    /// with an error envelope.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// The deadline of a blocking answer request, in seconds.
    #[serde(default = "default_rpc_timeout_s")]
    pub rpc_timeout_s: u64,
}

fn default_prefetch() -> u16 {
    1
}

fn default_max_retries() -> u32 {
    3
}

fn default_rpc_timeout_s() -> u64 {
    30
}

impl WorkerDefinition {
    /// Reports the input topic of this worker.
    pub fn topic(&self) -> &str {
        self.topic.as_deref().unwrap_or(&self.name)
    }

    /// Reports the answer topic of this worker, distinct from its input
    /// topic.
    pub fn answer_topic(&self) -> String {
        match &self.answer_topic {
            Some(answer_topic) => answer_topic.clone(),
            None => format!("{}__answer__{}", self.topic(), self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn deserializes_with_defaults() {
        // Given
        let yaml = r#"
            name: echo
            broker: main
            input_message: echo_message
        "#;

        // When
        let definition: WorkerDefinition = serde_yml::from_str(yaml).unwrap();

        // Then
        assert_eq!(definition.topic(), "echo");
        assert_eq!(definition.answer_topic(), "echo__answer__echo");
        assert_eq!(definition.prefetch, 1);
        assert_eq!(definition.max_retries, 3);
        assert_eq!(definition.rpc_timeout_s, 30);
        assert!(!definition.external);
        assert!(definition.waitings.is_empty());
    }

    #[test]
    fn explicit_topics_win_over_the_derived_ones() {
        // Given
        let yaml = r#"
            name: echo
            broker: main
            topic: echo_input
            answer_topic: echo_answers
            input_message: echo_message
            output_message: echo_message
            external: true
        "#;

        // When
        let definition: WorkerDefinition = serde_yml::from_str(yaml).unwrap();

        // Then
        assert_eq!(definition.topic(), "echo_input");
        assert_eq!(definition.answer_topic(), "echo_answers");
        assert_eq!(definition.output_message.as_deref(), Some("echo_message"));
        assert!(definition.external);
    }
}
