use serde::Deserialize;

/// Declares one waiting: an external dependency whose TCP reachability is
/// probed before the pipeline starts serving.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WaitingDefinition {
    /// The unique name of this waiting.
    pub name: String,
    /// The host to probe.
    pub host: String,
    /// The port to probe.
    pub port: u16,
    /// How long to keep probing before giving up, in seconds.
    #[serde(default = "default_timeout_s")]
    pub timeout_s: u64,
    /// How long to pause between probe attempts, in seconds.
    #[serde(default = "default_retry_delay_s")]
    pub retry_delay_s: u64,
}

fn default_timeout_s() -> u64 {
    15
}

fn default_retry_delay_s() -> u64 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn deserializes_with_defaults() {
        // Given
        let yaml = r#"
            name: database
            host: localhost
            port: 5432
        "#;

        // When
        let definition: WaitingDefinition = serde_yml::from_str(yaml).unwrap();

        // Then
        assert_eq!(definition.host, "localhost");
        assert_eq!(definition.port, 5432);
        assert_eq!(definition.timeout_s, 15);
        assert_eq!(definition.retry_delay_s, 1);
    }
}
