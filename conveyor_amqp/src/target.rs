use async_trait::async_trait;
use conveyor_transport::{Connectable, PoolError};
use lapin::{Connection, ConnectionProperties, Error as LapinError};
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use secure_string::SecureString;
use std::borrow::Cow;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use tracing::{info, warn};

const VHOST_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b'/') // Encode '/' as %2F
    .add(b'?') // Encode '?' as %3F
    .add(b'#') // Encode '#' as %23
    .add(b'%'); // Encode '%' as %25 (to avoid ambiguity)

/// Describes one AMQP cluster endpoint as a poolable connection target.
///
/// Two targets with the same host, port, user, password, and virtual host
/// hash to the same pool key and therefore share one underlying connection,
/// no matter how many broker instances are built on top.
///
/// The password is secured against accidental debug-printing; the virtual
/// host is percent-encoded internally and should be passed in human-readable
/// form.
#[derive(Clone)]
pub struct AmqpTarget {
    identifier: Arc<str>,
    dsn: SecureString,
    key: u64,
}

impl AmqpTarget {
    /// Creates a target for the given endpoint coordinates.
    pub fn new(
        host: impl AsRef<str>,
        port: u16,
        user: impl AsRef<str>,
        password: impl Into<SecureString>,
        vhost: impl AsRef<str>,
    ) -> Self {
        let host = host.as_ref();
        let user = user.as_ref();
        let password = password.into();
        let vhost = Self::ensure_encoded_vhost(vhost.as_ref());

        let identifier = Arc::from(format!("{}@{}:{}/{}", user, host, port, vhost));
        let key = Self::compose_key(host, port, user, &password, &vhost);
        let dsn = SecureString::from(format!(
            "amqp://{}:{}@{}:{}/{}",
            user,
            password.unsecure(),
            host,
            port,
            vhost,
        ));

        Self {
            identifier,
            dsn,
            key,
        }
    }

    /// Re-creates this target with the given heartbeat interval, carried as a
    /// DSN query parameter.
    pub fn with_heartbeat(self, heartbeat_s: u16) -> Self {
        let dsn = SecureString::from(format!(
            "{}?heartbeat={}",
            self.dsn.unsecure(),
            heartbeat_s,
        ));

        Self { dsn, ..self }
    }

    /// Ensures that the given `vhost` value is correctly percent-encoded to
    /// be included in a DSN.
    fn ensure_encoded_vhost(vhost: &str) -> Cow<'_, str> {
        utf8_percent_encode(vhost, VHOST_ENCODE_SET).into()
    }

    /// Hashes everything that distinguishes one endpoint from another.
    fn compose_key(host: &str, port: u16, user: &str, password: &SecureString, vhost: &str) -> u64 {
        let mut hasher = DefaultHasher::new();

        host.hash(&mut hasher);
        port.hash(&mut hasher);
        user.hash(&mut hasher);
        password.unsecure().hash(&mut hasher);
        vhost.hash(&mut hasher);

        hasher.finish()
    }
}

#[async_trait]
impl Connectable for AmqpTarget {
    type Connection = Connection;

    fn key(&self) -> u64 {
        self.key
    }

    fn identifier(&self) -> String {
        self.identifier.to_string()
    }

    async fn open(&self) -> Result<Connection, PoolError> {
        // Set up the connection properties to use the current Tokio context
        let connection_properties = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);

        Connection::connect(self.dsn.unsecure(), connection_properties)
            .await
            .map_err(|error| PoolError::new(self.identifier.as_ref(), error.to_string()))
    }

    async fn close(&self, connection: &Connection) {
        let result = connection.close(0, "Released connection").await;

        match result {
            Ok(_) => info!(
                identifier = self.identifier.as_ref(),
                "Closed an AMQP connection",
            ),
            Err(LapinError::InvalidConnectionState(_)) => info!(
                identifier = self.identifier.as_ref(),
                "Released a previously lost AMQP connection",
            ),
            Err(error) => warn!(
                identifier = self.identifier.as_ref(),
                ?error,
                error_message = %error,
                "Failed to cleanly close an AMQP connection",
            ),
        }
    }

    fn is_closed(&self, connection: &Connection) -> bool {
        !connection.status().connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn equal_endpoints_share_a_key() {
        // Given
        let target_a = AmqpTarget::new("localhost", 5672, "guest", "guest", "/");
        let target_b = AmqpTarget::new("localhost", 5672, "guest", "guest", "/");

        // Then
        assert_eq!(target_a.key(), target_b.key());
    }

    #[test]
    fn credentials_are_part_of_the_key() {
        // Given
        let target_a = AmqpTarget::new("localhost", 5672, "guest", "guest", "/");
        let target_b = AmqpTarget::new("localhost", 5672, "guest", "other", "/");

        // Then
        assert_ne!(target_a.key(), target_b.key());
    }

    #[test]
    fn identifier_hides_the_password() {
        // Given
        let target = AmqpTarget::new("localhost", 5672, "guest", "s3cret", "/");

        // Then
        assert_eq!(target.identifier(), "guest@localhost:5672/%2F");
    }
}
