use serde::Deserialize;
use serde_json::Value;

/// Declares one message type: a name and the JSON schema that payloads of
/// this message must satisfy.
///
/// The schema defaults to `true` (accept anything) so that free-form
/// messages need not spell one out.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MessageDefinition {
    /// The unique name of this message.
    pub name: String,
    /// The JSON schema of the payload.
    #[serde(default = "default_schema")]
    pub schema: Value,
}

fn default_schema() -> Value {
    Value::Bool(true)
}
