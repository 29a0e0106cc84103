//! Peer-keyed connection pool.
//!
//! Callers ask for "a live connection to this identity" and the pool either
//! returns the cached one, joins an in-flight dial, or starts a new dial.
//! Remote-initiated connections arriving from the transport are absorbed
//! into the same map; on a local/remote race the newer connection always
//! wins, and the close path only evicts an entry when the closing
//! connection's id still matches it.

use crate::identity::PublicKey;
use crate::net::connection::{Connection, ConnectionSource};
use crate::net::{Net, NetError};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

#[derive(Debug, Error, Clone)]
pub enum PoolError {
    #[error("connection pool was shut down")]
    Shutdown,

    #[error("there is no connection with this key")]
    NoSuchConnection,

    #[error("dial failed: {0}")]
    Dial(String),
}

/// The slice of the transport the pool needs: the ability to dial.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(
        &self,
        address: &str,
        remote_public_key: PublicKey,
    ) -> Result<Arc<Connection>, NetError>;
}

#[async_trait]
impl Dialer for Net {
    async fn dial(
        &self,
        address: &str,
        remote_public_key: PublicKey,
    ) -> Result<Arc<Connection>, NetError> {
        Net::dial(self, address, remote_public_key).await
    }
}

/// Hook invoked for every connection the transport reports closed.
pub type OnClose = Box<dyn Fn(Arc<Connection>) + Send + Sync>;

type DialResult = Result<Arc<Connection>, PoolError>;

/// `connections` and the shutdown flag share one lock so "am I shut down"
/// and "is this peer connected" are answered under the same guard.
struct ConnectionMap {
    connections: HashMap<String, Arc<Connection>>,
    shutdown: bool,
}

/// Deduplicating registry of live connections, keyed by remote public key.
///
/// Lock order: the connection map lock is always acquired before the
/// pending lock.
pub struct ConnectionPool {
    local_pub: PublicKey,
    dialer: Arc<dyn Dialer>,
    conn_state: RwLock<ConnectionMap>,
    pending: Mutex<HashMap<String, Vec<oneshot::Sender<DialResult>>>>,
    /// Every background dial task holds a clone; shutdown drops the pool's
    /// own and waits for the channel to close.
    dial_guard: Mutex<Option<mpsc::Sender<()>>>,
    dial_guard_done: tokio::sync::Mutex<mpsc::Receiver<()>>,
    on_close: RwLock<Option<OnClose>>,
    teardown_tx: mpsc::Sender<()>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    /// Build the pool and start its event loop over the transport's
    /// new-remote-connection and closing-connection streams.
    pub fn new(
        dialer: Arc<dyn Dialer>,
        local_pub: PublicKey,
        new_remote_rx: mpsc::Receiver<Arc<Connection>>,
        closing_rx: mpsc::Receiver<Arc<Connection>>,
    ) -> Arc<Self> {
        let (guard_tx, guard_rx) = mpsc::channel(1);
        let (teardown_tx, teardown_rx) = mpsc::channel(1);
        let pool = Arc::new(Self {
            local_pub,
            dialer,
            conn_state: RwLock::new(ConnectionMap {
                connections: HashMap::new(),
                shutdown: false,
            }),
            pending: Mutex::new(HashMap::new()),
            dial_guard: Mutex::new(Some(guard_tx)),
            dial_guard_done: tokio::sync::Mutex::new(guard_rx),
            on_close: RwLock::new(None),
            teardown_tx,
            event_loop: Mutex::new(None),
        });
        let handle = tokio::spawn(begin_event_processing(
            pool.clone(),
            new_remote_rx,
            closing_rx,
            teardown_rx,
        ));
        *pool.event_loop.lock() = Some(handle);
        pool
    }

    /// Register a hook to run whenever a connection closes.
    pub fn set_on_close(&self, hook: OnClose) {
        *self.on_close.write() = Some(hook);
    }

    /// Return the cached connection for `remote_pub_key`, if any.
    pub fn get_connection_if_exists(&self, remote_pub_key: &str) -> Result<Arc<Connection>, PoolError> {
        let state = self.conn_state.read();
        if state.shutdown {
            return Err(PoolError::Shutdown);
        }
        state
            .connections
            .get(remote_pub_key)
            .cloned()
            .ok_or(PoolError::NoSuchConnection)
    }

    /// Fetch the connection to `remote_pub`, dialing `address` if none
    /// exists. Concurrent callers for the same peer share a single dial:
    /// every caller blocks until that dial (or a remote-initiated
    /// connection) resolves, and all of them get the same result.
    pub async fn get_connection(
        self: &Arc<Self>,
        address: &str,
        remote_pub: &PublicKey,
    ) -> Result<Arc<Connection>, PoolError> {
        let receiver = {
            let state = self.conn_state.read();
            if state.shutdown {
                return Err(PoolError::Shutdown);
            }
            let key = remote_pub.to_string_key();
            if let Some(conn) = state.connections.get(&key) {
                return Ok(conn.clone());
            }
            // Registration happens while still holding the read guard:
            // a dial that resolves between the lookup above and this point
            // must not be able to notify-and-forget before we are in the
            // waiter list.
            let mut pending = self.pending.lock();
            let (tx, rx) = oneshot::channel();
            match pending.entry(key) {
                Entry::Occupied(mut waiters) => waiters.get_mut().push(tx),
                Entry::Vacant(slot) => {
                    // nobody is dialing this peer yet
                    slot.insert(vec![tx]);
                    self.spawn_dial(address.to_string(), remote_pub.clone());
                }
            }
            rx
        };
        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(PoolError::Shutdown),
        }
    }

    fn spawn_dial(self: &Arc<Self>, address: String, remote_pub: PublicKey) {
        let guard = match self.dial_guard.lock().clone() {
            Some(guard) => guard,
            // shutdown already dropped its sender; the flag check above
            // makes this unreachable, but a missing guard must not panic
            None => return,
        };
        let pool = self.clone();
        tokio::spawn(async move {
            let result = pool.dialer.dial(&address, remote_pub.clone()).await;
            match result {
                Ok(conn) => pool.handle_new_connection(&remote_pub, conn, ConnectionSource::Local),
                Err(e) => pool.handle_dial_result(&remote_pub, Err(PoolError::Dial(e.to_string()))),
            }
            drop(guard);
        });
    }

    /// Install `conn` as the connection for `remote_pub`, unconditionally
    /// replacing any previous entry, then wake every waiter.
    fn handle_new_connection(
        &self,
        remote_pub: &PublicKey,
        conn: Arc<Connection>,
        source: ConnectionSource,
    ) {
        {
            let mut state = self.conn_state.write();
            debug!(
                "new connection {} -> {}. id={} source={:?}",
                self.local_pub.pretty(),
                remote_pub.pretty(),
                conn.id(),
                source
            );
            // always take the new connection; the close path's id check
            // keeps a late close of the replaced one from evicting this
            state.connections.insert(remote_pub.to_string_key(), conn.clone());
        }
        self.handle_dial_result(remote_pub, Ok(conn));
    }

    /// Deliver `result` to every waiter registered for `remote_pub` and
    /// clear the pending entry.
    fn handle_dial_result(&self, remote_pub: &PublicKey, result: DialResult) {
        let waiters = self.pending.lock().remove(&remote_pub.to_string_key());
        if let Some(waiters) = waiters {
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        }
    }

    /// Drop the pool entry for a closed connection, but only when the entry
    /// still refers to that exact connection; a closing connection that was
    /// already replaced must not evict its replacement.
    fn handle_closed_connection(&self, conn: &Arc<Connection>) {
        debug!(
            "connection {} with {:?} was closed",
            conn.id(),
            conn.remote_public_key().map(|k| k.pretty())
        );
        if let Some(remote_pub) = conn.remote_public_key() {
            let key = remote_pub.to_string_key();
            let mut state = self.conn_state.write();
            let is_current = state
                .connections
                .get(&key)
                .map(|current| current.id() == conn.id())
                .unwrap_or(false);
            if is_current {
                state.connections.remove(&key);
            }
        }
        if let Some(hook) = self.on_close.read().as_ref() {
            hook(conn.clone());
        }
    }

    /// Graceful shutdown: refuse new work, wait for every in-flight dial to
    /// deliver its result, stop the event loop, then close every pooled
    /// connection. When this returns, no dial task is still running.
    pub async fn shutdown(&self) {
        {
            let mut state = self.conn_state.write();
            if state.shutdown {
                error!("shutdown was already called");
                return;
            }
            state.shutdown = true;
        }

        // wait for in-flight dials: the channel closes once every dial
        // task has dropped its guard
        drop(self.dial_guard.lock().take());
        self.dial_guard_done.lock().await.recv().await;

        let _ = self.teardown_tx.send(()).await;
        let handle = self.event_loop.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        // closing-connection events for these are not handled anymore;
        // the loop above is already gone
        let state = self.conn_state.read();
        for conn in state.connections.values() {
            conn.close();
        }
    }
}

async fn begin_event_processing(
    pool: Arc<ConnectionPool>,
    mut new_remote_rx: mpsc::Receiver<Arc<Connection>>,
    mut closing_rx: mpsc::Receiver<Arc<Connection>>,
    mut teardown_rx: mpsc::Receiver<()>,
) {
    loop {
        tokio::select! {
            Some(conn) = new_remote_rx.recv() => {
                match conn.remote_public_key() {
                    Some(remote_pub) => {
                        pool.handle_new_connection(&remote_pub, conn, ConnectionSource::Remote)
                    }
                    // remote connections are published post-handshake, so
                    // the key is always present; tolerate anyway
                    None => error!("remote connection {} arrived without a public key", conn.id()),
                }
            }
            Some(conn) = closing_rx.recv() => pool.handle_closed_connection(&conn),
            _ = teardown_rx.recv() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::attach;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::time::sleep;

    struct MockDialer {
        dial_count: AtomicUsize,
        latency: Duration,
        fail: bool,
        // keeps the far socket halves and pump tasks alive for the test
        keep: Mutex<Vec<(DuplexStream, crate::net::connection::ConnectionIo)>>,
    }

    impl MockDialer {
        fn new(latency: Duration) -> Arc<Self> {
            Arc::new(Self {
                dial_count: AtomicUsize::new(0),
                latency,
                fail: false,
                keep: Mutex::new(Vec::new()),
            })
        }

        fn failing(latency: Duration) -> Arc<Self> {
            Arc::new(Self {
                dial_count: AtomicUsize::new(0),
                latency,
                fail: true,
                keep: Mutex::new(Vec::new()),
            })
        }

        fn make_connection(&self, remote_pub: &PublicKey) -> Arc<Connection> {
            let (near, far) = tokio::io::duplex(1024);
            let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
            let (conn, io) = attach(near, addr, Some(remote_pub.clone()));
            self.keep.lock().push((far, io));
            conn
        }
    }

    #[async_trait]
    impl Dialer for MockDialer {
        async fn dial(
            &self,
            _address: &str,
            remote_public_key: PublicKey,
        ) -> Result<Arc<Connection>, NetError> {
            self.dial_count.fetch_add(1, Ordering::SeqCst);
            sleep(self.latency).await;
            if self.fail {
                return Err(NetError::HandshakeTimeout);
            }
            Ok(self.make_connection(&remote_public_key))
        }
    }

    struct Harness {
        pool: Arc<ConnectionPool>,
        dialer: Arc<MockDialer>,
        new_remote_tx: mpsc::Sender<Arc<Connection>>,
        closing_tx: mpsc::Sender<Arc<Connection>>,
    }

    fn harness(dialer: Arc<MockDialer>) -> Harness {
        let (new_remote_tx, new_remote_rx) = mpsc::channel(20);
        let (closing_tx, closing_rx) = mpsc::channel(20);
        let local = crate::identity::KeyPair::generate();
        let pool = ConnectionPool::new(
            dialer.clone(),
            local.public().clone(),
            new_remote_rx,
            closing_rx,
        );
        Harness {
            pool,
            dialer,
            new_remote_tx,
            closing_tx,
        }
    }

    fn peer() -> PublicKey {
        crate::identity::KeyPair::generate().public().clone()
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_dial() {
        let h = harness(MockDialer::new(Duration::from_millis(200)));
        let remote = peer();

        let mut tasks = Vec::new();
        for _ in 0..50 {
            let pool = h.pool.clone();
            let remote = remote.clone();
            tasks.push(tokio::spawn(async move {
                pool.get_connection("127.0.0.1:9999", &remote).await
            }));
        }

        let mut ids = Vec::new();
        for task in tasks {
            let conn = task.await.unwrap().unwrap();
            ids.push(conn.id().to_string());
        }
        assert_eq!(h.dialer.dial_count.load(Ordering::SeqCst), 1);
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert!(h.pool.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn failed_dial_reaches_every_waiter() {
        let h = harness(MockDialer::failing(Duration::from_millis(50)));
        let remote = peer();

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let pool = h.pool.clone();
            let remote = remote.clone();
            tasks.push(tokio::spawn(async move {
                pool.get_connection("127.0.0.1:9999", &remote).await
            }));
        }
        for task in tasks {
            let result = task.await.unwrap();
            assert!(matches!(result, Err(PoolError::Dial(_))));
        }
        assert!(h.pool.pending.lock().is_empty());
        assert_eq!(h.dialer.dial_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cached_connection_skips_dialing() {
        let h = harness(MockDialer::new(Duration::from_millis(10)));
        let remote = peer();

        let first = h.pool.get_connection("127.0.0.1:9999", &remote).await.unwrap();
        let second = h.pool.get_connection("127.0.0.1:9999", &remote).await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(h.dialer.dial_count.load(Ordering::SeqCst), 1);

        assert!(h
            .pool
            .get_connection_if_exists(&remote.to_string_key())
            .is_ok());
        assert!(matches!(
            h.pool.get_connection_if_exists(&peer().to_string_key()),
            Err(PoolError::NoSuchConnection)
        ));
    }

    #[tokio::test]
    async fn remote_arrival_wakes_waiters_and_newest_wins() {
        let h = harness(MockDialer::new(Duration::from_millis(200)));
        let remote = peer();

        // start a dial, then have the remote beat it
        let pool = h.pool.clone();
        let remote_for_task = remote.clone();
        let waiter = tokio::spawn(async move {
            pool.get_connection("127.0.0.1:9999", &remote_for_task).await
        });
        sleep(Duration::from_millis(50)).await;

        let remote_conn = h.dialer.make_connection(&remote);
        h.new_remote_tx.send(remote_conn.clone()).await.unwrap();

        // the waiter is released by the remote connection
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.id(), remote_conn.id());

        // when the local dial lands it overwrites the entry
        sleep(Duration::from_millis(250)).await;
        let current = h
            .pool
            .get_connection_if_exists(&remote.to_string_key())
            .unwrap();
        assert_ne!(current.id(), remote_conn.id());

        // a late close of the superseded connection must not evict the
        // current entry
        h.closing_tx.send(remote_conn).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert!(h
            .pool
            .get_connection_if_exists(&remote.to_string_key())
            .is_ok());

        // closing the current entry does evict it
        h.closing_tx.send(current).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            h.pool.get_connection_if_exists(&remote.to_string_key()),
            Err(PoolError::NoSuchConnection)
        ));
    }

    #[tokio::test]
    async fn shutdown_waits_for_inflight_dials_and_closes_everything() {
        let h = harness(MockDialer::new(Duration::from_millis(500)));

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let pool = h.pool.clone();
            let remote = peer();
            tasks.push(tokio::spawn(async move {
                pool.get_connection("127.0.0.1:9999", &remote).await
            }));
        }
        sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        h.pool.shutdown().await;
        // all ten dials (500 ms latency) must have finished first
        assert!(started.elapsed() >= Duration::from_millis(400));

        for task in tasks {
            // every caller got its connection or a terminal error
            let _ = task.await.unwrap();
        }
        let state = h.pool.conn_state.read();
        assert_eq!(state.connections.len(), 10);
        for conn in state.connections.values() {
            assert!(conn.is_closed());
        }
    }

    #[tokio::test]
    async fn get_connection_after_shutdown_fails() {
        let h = harness(MockDialer::new(Duration::from_millis(1)));
        h.pool.shutdown().await;
        let result = h.pool.get_connection("127.0.0.1:9999", &peer()).await;
        assert!(matches!(result, Err(PoolError::Shutdown)));
        assert!(matches!(
            h.pool.get_connection_if_exists(&peer().to_string_key()),
            Err(PoolError::Shutdown)
        ));
        // second shutdown is a logged no-op
        h.pool.shutdown().await;
    }

    #[tokio::test]
    async fn on_close_hook_runs() {
        let h = harness(MockDialer::new(Duration::from_millis(1)));
        let remote = peer();
        let hits = Arc::new(AtomicUsize::new(0));
        let hook_hits = hits.clone();
        h.pool.set_on_close(Box::new(move |_conn| {
            hook_hits.fetch_add(1, Ordering::SeqCst);
        }));

        let conn = h.pool.get_connection("127.0.0.1:9999", &remote).await.unwrap();
        h.closing_tx.send(conn).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
