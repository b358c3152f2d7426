//! Origin connection pools, interned process-wide by endpoint key.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex};

use dashmap::DashMap;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::{BoxedStream, Connector, NetError};

static REGISTRY: LazyLock<DashMap<String, Arc<ConnectionPool>>> = LazyLock::new(DashMap::new);

#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    pub connect_timeout: Duration,
    pub max_idle: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            max_idle: 32,
        }
    }
}

/// A shared pool of idle origin streams for one endpoint.
///
/// Pools created without a dialer (`init = false`) are fed externally by a
/// publisher's reverse-attach path and return nothing when empty.
pub struct ConnectionPool {
    key: String,
    connector: Option<Connector>,
    options: PoolOptions,
    acquisitions: AtomicUsize,
    idle: Mutex<Vec<BoxedStream>>,
}

impl ConnectionPool {
    fn new(key: &str, connector: Option<Connector>, options: PoolOptions) -> Self {
        Self {
            key: key.to_string(),
            connector,
            options,
            acquisitions: AtomicUsize::new(0),
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether checkouts may dial new connections.
    pub fn dials(&self) -> bool {
        self.connector.is_some()
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Take an idle stream (most recently used first) or dial a fresh one.
    /// Returns `None` when the endpoint is unreachable or the pool never
    /// dials and is empty.
    pub async fn checkout(&self) -> Option<BoxedStream> {
        if let Some(stream) = self.idle.lock().unwrap_or_else(|e| e.into_inner()).pop() {
            debug!(target: "narthex::pool", endpoint = %self.key, "Reusing pooled origin connection");
            return Some(stream);
        }

        let connector = self.connector.as_ref()?;
        match connector.dial(self.options.connect_timeout).await {
            Ok(stream) => {
                debug!(target: "narthex::pool", endpoint = %self.key, "Dialed new origin connection");
                Some(stream)
            }
            Err(err) => {
                warn!(
                    target: "narthex::pool",
                    endpoint = %self.key,
                    error = %err,
                    "Origin dial failed"
                );
                None
            }
        }
    }

    /// Return a healthy stream to the idle set. Streams beyond the idle cap
    /// are dropped (closed).
    pub fn checkin(&self, stream: BoxedStream) {
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        if idle.len() >= self.options.max_idle {
            debug!(target: "narthex::pool", endpoint = %self.key, "Pool full; dropping connection");
            return;
        }
        idle.push(stream);
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("key", &self.key)
            .field("dials", &self.dials())
            .field("acquisitions", &self.acquisitions.load(Ordering::Relaxed))
            .finish()
    }
}

/// One share of an interned pool. Dropping the last share removes the pool
/// from the registry, closing any idle streams with it.
pub struct PoolHandle {
    pool: Arc<ConnectionPool>,
}

impl PoolHandle {
    /// Intern (or join) the pool for `key`. With `init = true` the key must
    /// be a valid connector string and checkouts may dial; with `init =
    /// false` the key is opaque and the pool only ever yields streams fed
    /// via [`ConnectionPool::checkin`].
    pub fn acquire(key: &str, init: bool, options: PoolOptions) -> Result<Self, NetError> {
        let connector = if init { Some(Connector::parse(key)?) } else { None };

        let pool = {
            let entry = REGISTRY
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(ConnectionPool::new(key, connector, options)));
            // Counted under the shard lock so release can't race us.
            entry.value().acquisitions.fetch_add(1, Ordering::SeqCst);
            entry.value().clone()
        };

        Ok(Self { pool })
    }

    /// A shared reference for async work that must outlive this handle
    /// (in-flight forwards keep the pool alive through it).
    pub fn pool(&self) -> Arc<ConnectionPool> {
        self.pool.clone()
    }
}

impl std::ops::Deref for PoolHandle {
    type Target = ConnectionPool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl Drop for PoolHandle {
    fn drop(&mut self) {
        REGISTRY.remove_if(self.pool.key(), |_, pool| {
            pool.acquisitions.fetch_sub(1, Ordering::SeqCst) == 1
        });
    }
}

impl std::fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.pool.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::{PoolHandle, PoolOptions, REGISTRY};

    fn stream() -> crate::BoxedStream {
        let (a, _b) = tokio::io::duplex(64);
        Box::new(a)
    }

    #[test]
    fn shares_are_counted_and_destroyed_at_zero() {
        let key = "tcp:10.0.0.1:9001";
        let first = PoolHandle::acquire(key, true, PoolOptions::default()).unwrap();
        let second = PoolHandle::acquire(key, true, PoolOptions::default()).unwrap();
        assert!(std::sync::Arc::ptr_eq(&first.pool(), &second.pool()));
        drop(first);
        assert!(REGISTRY.contains_key(key));
        drop(second);
        assert!(!REGISTRY.contains_key(key));
    }

    #[test]
    fn acquire_rejects_bad_connectors() {
        assert!(PoolHandle::acquire("ipx:whatever:1", true, PoolOptions::default()).is_err());
        // Opaque keys are fine for reverse pools.
        let handle = PoolHandle::acquire("/svc", false, PoolOptions::default()).unwrap();
        assert!(!handle.dials());
    }

    #[tokio::test]
    async fn reverse_pool_checkout_is_empty_until_fed() {
        let handle = PoolHandle::acquire("/feed-me", false, PoolOptions::default()).unwrap();
        assert!(handle.checkout().await.is_none());
        handle.checkin(stream());
        assert_eq!(handle.idle_count(), 1);
        assert!(handle.checkout().await.is_some());
        assert_eq!(handle.idle_count(), 0);
    }

    #[tokio::test]
    async fn checkout_checkin_leaves_idle_size_unchanged() {
        let handle = PoolHandle::acquire("/balance", false, PoolOptions::default()).unwrap();
        handle.checkin(stream());
        let before = handle.idle_count();
        let s = handle.checkout().await.unwrap();
        handle.checkin(s);
        assert_eq!(handle.idle_count(), before);
    }

    #[test]
    fn idle_cap_is_enforced() {
        let options = PoolOptions {
            max_idle: 1,
            ..PoolOptions::default()
        };
        let handle = PoolHandle::acquire("/capped", false, options).unwrap();
        handle.checkin(stream());
        handle.checkin(stream());
        assert_eq!(handle.idle_count(), 1);
    }
}
