use serde::Deserialize;
use serde_json::{Value, json};

/// Declares one cron task: a synthetic message injected into a worker on a
/// 5-field cron schedule.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CronTaskDefinition {
    /// The unique name of this task; travels in the synthetic payload as
    /// `task_name`.
    pub name: String,
    /// The logical name of the worker receiving the synthetic messages.
    pub worker: String,
    /// The 5-field cron expression (minute, hour, day of month, month, day
    /// of week).
    pub when: String,
    /// Whether a firing is suppressed while the previous synthetic message
    /// of this task is still enqueued.
    #[serde(default = "default_alone")]
    pub alone: bool,
    /// The template of the synthetic payload; `task_name` is merged in.
    #[serde(default)]
    pub payload: Value,
}

fn default_alone() -> bool {
    true
}

impl CronTaskDefinition {
    /// Composes the synthetic payload of one firing: the template (when it
    /// is an object) with `task_name` merged in.
    pub fn synthetic_payload(&self) -> Value {
        match &self.payload {
            Value::Object(template) => {
                let mut payload = template.clone();
                payload.insert("task_name".to_string(), json!(self.name));

                Value::Object(payload)
            }
            _ => json!({ "task_name": self.name }),
        }
    }
}
