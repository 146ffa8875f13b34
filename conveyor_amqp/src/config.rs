use lapin::ExchangeKind;
use serde::Deserialize;
use serde_json::Value;

/// The driver-specific configuration of an [`AmqpBroker`](crate::AmqpBroker),
/// deserialized from the `dynamic_props` of a broker definition.
///
/// Every field has an opinionated default, so an empty `dynamic_props` yields
/// a working configuration: a durable direct exchange named `communication`
/// with persistent deliveries.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AmqpProps {
    /// The host of the AMQP cluster.
    pub host: String,
    /// The port of the AMQP cluster.
    pub port: u16,
    /// The user to authenticate as.
    pub user: String,
    /// The password to authenticate with.
    pub password: String,
    /// The virtual host, in human-readable (non-encoded) form.
    pub vhost: String,
    /// The name of the exchange all topics bind to.
    pub exchange_name: String,
    /// The kind of the exchange (`direct`, `fanout`, `topic`, `headers`).
    pub exchange_type: String,
    /// Whether the exchange and the topic queues survive a broker restart.
    pub durable: bool,
    /// Whether the exchange and the topic queues are deleted once unused.
    pub auto_delete: bool,
    /// Whether the exchange declaration is passive (checks existence without
    /// creating).
    pub passive: bool,
    /// Whether published messages are marked persistent
    /// (`delivery_mode = 2`).
    pub is_persistent: bool,
    /// The connection heartbeat interval, in seconds.
    pub heartbeat: u16,
}

impl Default for AmqpProps {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            user: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            exchange_name: "communication".to_string(),
            exchange_type: "direct".to_string(),
            durable: true,
            auto_delete: false,
            passive: false,
            is_persistent: true,
            heartbeat: 600,
        }
    }
}

impl AmqpProps {
    /// Deserializes the given `dynamic_props` value, filling absent fields
    /// with the defaults. A `null` value yields the full defaults.
    pub fn from_dynamic(dynamic_props: &Value) -> Result<Self, serde_json::Error> {
        if dynamic_props.is_null() {
            return Ok(Self::default());
        }

        serde_json::from_value(dynamic_props.clone())
    }

    /// Composes the poolable [`AmqpTarget`](crate::AmqpTarget) for the
    /// endpoint coordinates of this configuration, heartbeat included.
    pub fn target(&self) -> crate::AmqpTarget {
        crate::AmqpTarget::new(
            &self.host,
            self.port,
            &self.user,
            self.password.as_str(),
            &self.vhost,
        )
        .with_heartbeat(self.heartbeat)
    }

    /// Maps the configured exchange type onto the `lapin` representation.
    pub fn exchange_kind(&self) -> ExchangeKind {
        match self.exchange_type.as_str() {
            "fanout" => ExchangeKind::Fanout,
            "headers" => ExchangeKind::Headers,
            "topic" => ExchangeKind::Topic,
            "direct" => ExchangeKind::Direct,
            custom => ExchangeKind::Custom(custom.to_string()),
        }
    }
}
