use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

/// Represents a failure to open a pooled connection.
#[derive(Error, Debug)]
#[error("failed to connect to '{target}': {message}")]
pub struct PoolError {
    /// A non-sensitive identifier of the connection target.
    pub target: String,
    /// The underlying error, stringified.
    pub message: String,
}

impl PoolError {
    /// Creates a pool error for the given target.
    pub fn new(target: impl AsRef<str>, message: impl AsRef<str>) -> Self {
        Self {
            target: target.as_ref().to_string(),
            message: message.as_ref().to_string(),
        }
    }
}

/// Describes a connection target that can be pooled.
///
/// Two targets with the same [key](Connectable::key) are considered to point
/// at the same endpoint and share one underlying connection. The key should
/// cover everything that distinguishes endpoints (host, port, credentials,
/// virtual host; bootstrap set) and nothing else.
#[async_trait]
pub trait Connectable: Send + Sync + 'static {
    /// The type of the underlying connection object.
    type Connection: Send + Sync + 'static;

    /// Reports the hash key of this target.
    fn key(&self) -> u64;

    /// Reports a non-sensitive identifier of this target, for logging.
    fn identifier(&self) -> String;

    /// Opens a fresh connection to this target. Open errors are surfaced to
    /// the caller, never swallowed.
    async fn open(&self) -> Result<Self::Connection, PoolError>;

    /// Closes the given connection.
    async fn close(&self, connection: &Self::Connection);

    /// Reports whether the given connection has gone bad and must be
    /// replaced before use.
    fn is_closed(&self, connection: &Self::Connection) -> bool;
}

/// A registry of connections keyed by their target's hash, shared across all
/// broker instances that point at the same endpoint.
///
/// The pool itself holds no driver knowledge: drivers describe their
/// endpoints via [`Connectable`] and receive [`PoolManager`] handles. The
/// first manager to [connect](PoolManager::connect) opens the connection; the
/// last one to [close](PoolManager::close) tears it down.
///
/// A pool is an explicit object passed into broker constructors. Driver
/// crates may offer a process-wide default instance for convenience, but
/// tests should always wire their own.
pub struct ConnectionPool<C>
where
    C: Connectable,
{
    entries: AsyncMutex<HashMap<u64, PoolEntry<C::Connection>>>,
}

/// A single keyed slot of the pool.
struct PoolEntry<T> {
    connection: Option<Arc<T>>,
    leases: usize,
}

impl<T> PoolEntry<T> {
    fn empty() -> Self {
        Self {
            connection: None,
            leases: 0,
        }
    }
}

impl<C> ConnectionPool<C>
where
    C: Connectable,
{
    /// Creates an empty pool.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: AsyncMutex::new(HashMap::new()),
        })
    }

    /// Creates a manager for the given target. If an equal-keyed connection
    /// already lives in this pool, the manager aliases to it; otherwise the
    /// manager's first [connect](PoolManager::connect) installs one.
    pub fn manager(self: &Arc<Self>, target: C) -> PoolManager<C> {
        let key = target.key();

        PoolManager {
            pool: Arc::clone(self),
            target: Arc::new(target),
            key,
            leased: SyncMutex::new(false),
        }
    }

    /// Reports the number of leases currently held against the given key.
    pub async fn leases(&self, key: u64) -> usize {
        self.entries
            .lock()
            .await
            .get(&key)
            .map(|entry| entry.leases)
            .unwrap_or(0)
    }

    /// Reports the number of live keyed connections in this pool.
    pub async fn size(&self) -> usize {
        self.entries.lock().await.len()
    }
}

/// A handle onto one keyed slot of a [`ConnectionPool`].
///
/// A manager holds at most one lease on the underlying connection: the first
/// successful [connect](PoolManager::connect) takes the lease, repeated
/// connects merely refresh the handle (transparently reopening a connection
/// that has gone bad), and [close](PoolManager::close) releases the lease.
/// When the last lease on a key is released, the pool closes the connection
/// and evicts the slot.
pub struct PoolManager<C>
where
    C: Connectable,
{
    pool: Arc<ConnectionPool<C>>,
    target: Arc<C>,
    key: u64,
    leased: SyncMutex<bool>,
}

impl<C> PoolManager<C>
where
    C: Connectable,
{
    /// Reports the pool key of this manager's target.
    pub fn key(&self) -> u64 {
        self.key
    }

    /// Returns the shared connection for this manager's target, opening or
    /// reopening it if necessary.
    pub async fn connect(&self) -> Result<Arc<C::Connection>, PoolError> {
        let mut entries = self.pool.entries.lock().await;

        // Reuse the pooled connection when it is present and still open
        let pooled = entries
            .get(&self.key)
            .and_then(|entry| entry.connection.clone())
            .filter(|connection| !self.target.is_closed(connection));

        let connection = match pooled {
            Some(connection) => connection,
            None => {
                let fresh = Arc::new(self.open_fresh().await?);

                let entry = entries.entry(self.key).or_insert_with(PoolEntry::empty);
                entry.connection = Some(Arc::clone(&fresh));

                fresh
            }
        };

        // The first successful connect on this manager takes out a lease
        let mut leased = self.leased.lock();
        if !*leased {
            *leased = true;

            if let Some(entry) = entries.get_mut(&self.key) {
                entry.leases += 1;
            }
        }

        Ok(connection)
    }

    /// Releases this manager's lease. When the last lease on the key is
    /// released, the underlying connection is closed and the slot evicted.
    pub async fn close(&self) {
        let held = std::mem::replace(&mut *self.leased.lock(), false);

        if !held {
            return;
        }

        let mut entries = self.pool.entries.lock().await;

        let Some(entry) = entries.get_mut(&self.key) else {
            return;
        };

        entry.leases = entry.leases.saturating_sub(1);

        if entry.leases == 0 {
            if let Some(connection) = entry.connection.take() {
                info!(
                    target = self.target.identifier(),
                    "Closing a pooled connection with no remaining leases",
                );

                self.target.close(&connection).await;
            }

            entries.remove(&self.key);
        }
    }

    /// Opens a fresh connection for this manager's target, with reporting.
    async fn open_fresh(&self) -> Result<C::Connection, PoolError> {
        info!(
            target = self.target.identifier(),
            "Opening a pooled connection",
        );

        match self.target.open().await {
            Ok(connection) => Ok(connection),
            Err(error) => {
                warn!(
                    target = self.target.identifier(),
                    ?error,
                    error_message = %error,
                    "Failed to open a pooled connection",
                );

                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeTarget {
        key: u64,
        opens: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
        broken: Arc<AtomicBool>,
        refuse: bool,
    }

    struct FakeConnection {
        broken: Arc<AtomicBool>,
    }

    impl FakeTarget {
        fn new(key: u64) -> (Self, Arc<AtomicUsize>, Arc<AtomicUsize>, Arc<AtomicBool>) {
            let opens = Arc::new(AtomicUsize::new(0));
            let closes = Arc::new(AtomicUsize::new(0));
            let broken = Arc::new(AtomicBool::new(false));

            let target = Self {
                key,
                opens: Arc::clone(&opens),
                closes: Arc::clone(&closes),
                broken: Arc::clone(&broken),
                refuse: false,
            };

            (target, opens, closes, broken)
        }
    }

    #[async_trait]
    impl Connectable for FakeTarget {
        type Connection = FakeConnection;

        fn key(&self) -> u64 {
            self.key
        }

        fn identifier(&self) -> String {
            format!("fake:{}", self.key)
        }

        async fn open(&self) -> Result<FakeConnection, PoolError> {
            if self.refuse {
                return Err(PoolError::new(self.identifier(), "connection refused"));
            }

            self.opens.fetch_add(1, Ordering::Relaxed);
            self.broken.store(false, Ordering::Relaxed);

            Ok(FakeConnection {
                broken: Arc::clone(&self.broken),
            })
        }

        async fn close(&self, _connection: &FakeConnection) {
            self.closes.fetch_add(1, Ordering::Relaxed);
        }

        fn is_closed(&self, connection: &FakeConnection) -> bool {
            connection.broken.load(Ordering::Relaxed)
        }
    }

    #[tokio::test]
    async fn equal_keyed_managers_share_one_connection() {
        // Given
        let pool = ConnectionPool::new();
        let (target_a, opens, _, _) = FakeTarget::new(7);
        let (target_b, _, _, _) = FakeTarget::new(7);
        let manager_a = pool.manager(target_a);
        let manager_b = pool.manager(target_b);

        // When
        manager_a.connect().await.unwrap();
        manager_b.connect().await.unwrap();

        // Then
        assert_eq!(opens.load(Ordering::Relaxed), 1);
        assert_eq!(pool.leases(7).await, 2);
        assert_eq!(pool.size().await, 1);
    }

    #[tokio::test]
    async fn last_close_tears_the_connection_down() {
        // Given
        let pool = ConnectionPool::new();
        let (target_a, _, closes, _) = FakeTarget::new(7);
        let (target_b, _, _, _) = FakeTarget::new(7);
        let manager_a = pool.manager(target_a);
        let manager_b = pool.manager(target_b);
        manager_a.connect().await.unwrap();
        manager_b.connect().await.unwrap();

        // When
        manager_a.close().await;

        // Then: the other lease keeps the connection alive
        assert_eq!(closes.load(Ordering::Relaxed), 0);
        assert_eq!(pool.leases(7).await, 1);

        // When
        manager_b.close().await;

        // Then: refcount reached zero
        assert_eq!(closes.load(Ordering::Relaxed), 1);
        assert_eq!(pool.size().await, 0);
    }

    #[tokio::test]
    async fn repeated_connect_takes_a_single_lease() {
        // Given
        let pool = ConnectionPool::new();
        let (target, _, _, _) = FakeTarget::new(3);
        let manager = pool.manager(target);

        // When
        manager.connect().await.unwrap();
        manager.connect().await.unwrap();

        // Then
        assert_eq!(pool.leases(3).await, 1);
    }

    #[tokio::test]
    async fn broken_connection_is_reopened_transparently() {
        // Given
        let pool = ConnectionPool::new();
        let (target, opens, _, broken) = FakeTarget::new(3);
        let manager = pool.manager(target);
        manager.connect().await.unwrap();

        // When
        broken.store(true, Ordering::Relaxed);
        manager.connect().await.unwrap();

        // Then
        assert_eq!(opens.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn connect_errors_are_surfaced() {
        // Given
        let pool = ConnectionPool::new();
        let (mut target, _, _, _) = FakeTarget::new(3);
        target.refuse = true;
        let manager = pool.manager(target);

        // When
        let result = manager.connect().await;

        // Then
        assert!(result.is_err());
        assert_eq!(pool.leases(3).await, 0);
        assert_eq!(pool.size().await, 0);
    }
}
