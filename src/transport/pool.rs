//! Bounded connection reuse.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

use super::connector::{Connection, Connector, IncomingBody};
use crate::config::EndpointConfig;
use crate::request::Body;

/// Counters describing what the pool has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections opened through the connector.
    pub opened: u64,
    /// Checkouts served by an idle connection.
    pub reused: u64,
    /// Connections returned to the idle list after a clean exchange.
    pub released: u64,
    /// Connections dropped mid-exchange and never reused.
    pub abandoned: u64,
}

struct Idle {
    conn: Box<dyn Connection>,
    since: Instant,
}

struct Shared {
    connector: Arc<dyn Connector>,
    endpoint: EndpointConfig,
    idle: Mutex<Vec<Idle>>,
    permits: Arc<Semaphore>,
    idle_timeout: Duration,
    opened: AtomicU64,
    reused: AtomicU64,
    released: AtomicU64,
    abandoned: AtomicU64,
}

/// Connections to one endpoint, bounded in number and reused when idle.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<Shared>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("endpoint", &self.shared.endpoint.authority())
            .field("idle", &self.idle_count())
            .field("available", &self.shared.permits.available_permits())
            .field("stats", &self.stats())
            .finish()
    }
}

impl ConnectionPool {
    /// A pool that opens at most `max_connections` concurrent connections via `connector`.
    pub fn new(
        connector: Arc<dyn Connector>,
        endpoint: EndpointConfig,
        max_connections: usize,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                connector,
                endpoint,
                idle: Mutex::new(Vec::new()),
                permits: Arc::new(Semaphore::new(max_connections.max(1))),
                idle_timeout,
                opened: AtomicU64::new(0),
                reused: AtomicU64::new(0),
                released: AtomicU64::new(0),
                abandoned: AtomicU64::new(0),
            }),
        }
    }

    /// Waits for a free slot, then hands out an idle connection or opens a new one.
    ///
    /// Unbounded on its own; callers wrap it in their attempt deadline.
    pub async fn checkout(&self) -> io::Result<PooledConnection> {
        let permit = self
            .shared
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| io::Error::other("connection pool closed"))?;

        loop {
            let candidate = self.shared.idle.lock().pop();
            let Some(idle) = candidate else { break };
            if idle.since.elapsed() < self.shared.idle_timeout && idle.conn.is_open() {
                self.shared.reused.fetch_add(1, Ordering::Relaxed);
                return Ok(PooledConnection::new(idle.conn, self.shared.clone(), permit, true));
            }
            debug!("dropping stale idle connection");
        }

        let conn = self.shared.connector.connect(&self.shared.endpoint).await?;
        self.shared.opened.fetch_add(1, Ordering::Relaxed);
        Ok(PooledConnection::new(conn, self.shared.clone(), permit, false))
    }

    /// Number of idle connections ready for reuse.
    pub fn idle_count(&self) -> usize {
        self.shared.idle.lock().len()
    }

    /// Snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            opened: self.shared.opened.load(Ordering::Relaxed),
            reused: self.shared.reused.load(Ordering::Relaxed),
            released: self.shared.released.load(Ordering::Relaxed),
            abandoned: self.shared.abandoned.load(Ordering::Relaxed),
        }
    }
}

/// A checked-out connection.
///
/// [`release`](Self::release) puts it back for reuse; dropping it instead abandons the
/// connection, which is what every early exit does.
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    shared: Arc<Shared>,
    reused: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    fn new(
        conn: Box<dyn Connection>,
        shared: Arc<Shared>,
        permit: OwnedSemaphorePermit,
        reused: bool,
    ) -> Self {
        Self {
            conn: Some(conn),
            shared,
            reused,
            _permit: permit,
        }
    }

    /// Whether this connection carried an earlier exchange.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// Sends one request on the connection.
    pub async fn send(
        &mut self,
        request: http::Request<Body>,
    ) -> io::Result<http::Response<IncomingBody>> {
        match self.conn.as_mut() {
            Some(conn) => conn.send(request).await,
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection already released",
            )),
        }
    }

    /// Returns the connection to the pool after a complete exchange.
    pub fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            if conn.is_open() {
                self.shared.released.fetch_add(1, Ordering::Relaxed);
                self.shared.idle.lock().push(Idle {
                    conn,
                    since: Instant::now(),
                });
            } else {
                debug!("connection closed by peer, not pooling");
            }
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.conn.take().is_some() {
            self.shared.abandoned.fetch_add(1, Ordering::Relaxed);
            debug!("abandoning connection");
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("reused", &self.reused)
            .field("released", &self.conn.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::connector::testing::{ScriptedConnector, Step};
    use futures::StreamExt;

    fn pool(connector: &ScriptedConnector, max: usize, idle: Duration) -> ConnectionPool {
        let endpoint = EndpointConfig::parse("localhost:9000", false, "us-east-1").unwrap();
        ConnectionPool::new(Arc::new(connector.clone()), endpoint, max, idle)
    }

    fn get() -> http::Request<Body> {
        http::Request::builder().uri("/b").body(Body::Empty).unwrap()
    }

    #[tokio::test]
    async fn released_connections_are_reused() {
        let connector = ScriptedConnector::new([Step::status(200), Step::status(200)]);
        let pool = pool(&connector, 4, Duration::from_secs(60));

        let mut conn = pool.checkout().await.unwrap();
        assert!(!conn.is_reused());
        let response = conn.send(get()).await.unwrap();
        assert_eq!(response.into_body().count().await, 0);
        conn.release();
        assert_eq!(pool.idle_count(), 1);

        let conn = pool.checkout().await.unwrap();
        assert!(conn.is_reused());
        assert_eq!(connector.connects(), 1);
        conn.release();

        let stats = pool.stats();
        assert_eq!(
            stats,
            PoolStats {
                opened: 1,
                reused: 1,
                released: 2,
                abandoned: 0
            }
        );
    }

    #[tokio::test]
    async fn dropped_connections_are_abandoned() {
        let connector = ScriptedConnector::default();
        let pool = pool(&connector, 4, Duration::from_secs(60));

        drop(pool.checkout().await.unwrap());
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.stats().abandoned, 1);

        pool.checkout().await.unwrap().release();
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test]
    async fn closed_connections_are_not_pooled() {
        let connector = ScriptedConnector::new([Step::Fail(io::ErrorKind::ConnectionReset)]);
        let pool = pool(&connector, 4, Duration::from_secs(60));

        let mut conn = pool.checkout().await.unwrap();
        assert!(conn.send(get()).await.is_err());
        conn.release();
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_idle_connections_are_replaced() {
        let connector = ScriptedConnector::default();
        let pool = pool(&connector, 4, Duration::from_secs(5));

        pool.checkout().await.unwrap().release();
        tokio::time::advance(Duration::from_secs(6)).await;
        let conn = pool.checkout().await.unwrap();
        assert!(!conn.is_reused());
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn checkout_waits_for_a_free_slot() {
        let pool = pool(&ScriptedConnector::default(), 1, Duration::from_secs(60));
        let held = pool.checkout().await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(50), pool.checkout()).await;
        assert!(blocked.is_err());

        held.release();
        let conn = tokio::time::timeout(Duration::from_millis(50), pool.checkout()).await;
        assert!(conn.unwrap().unwrap().is_reused());
    }
}
