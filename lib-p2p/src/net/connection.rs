//! A live, framed, full-duplex link to one peer.
//!
//! The socket is split into a reader task and a writer task at attach time;
//! the [`Connection`] handle itself holds no I/O resources, only the
//! outbound queue and the close latch, so it can be cloned behind an `Arc`
//! into the pool, the swarm, and protocol handlers.

use crate::identity::PublicKey;
use crate::net::delimited;
use crate::net::session::NetworkSession;
use crate::net::{IncomingMessageEvent, NetError, PreSessionHandler};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use uuid::Uuid;

/// Frame queue depth per direction.
const FRAME_QUEUE_DEPTH: usize = 10;

/// Who initiated a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionSource {
    Local,
    Remote,
}

/// Connection handle. See the module docs for the ownership model.
///
/// After the handshake attaches a session, `remote_public_key` is non-empty
/// for the rest of the connection's life.
pub struct Connection {
    id: String,
    created: SystemTime,
    remote_addr: SocketAddr,
    remote_pub: RwLock<Option<PublicKey>>,
    remote_listen_port: AtomicU16,
    session: RwLock<Option<Arc<NetworkSession>>>,
    outbound: mpsc::Sender<Vec<u8>>,
    close_signal: Mutex<Option<oneshot::Sender<()>>>,
}

impl Connection {
    /// Unique connection id.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created(&self) -> SystemTime {
        self.created
    }

    /// Address of the remote endpoint of the socket. Note this is the
    /// ephemeral source address for accepted connections; the peer's dialable
    /// port is `remote_listen_port`.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Port the peer's own listener is bound to, as declared in its
    /// handshake (or parsed from the dial address for local dials).
    pub fn remote_listen_port(&self) -> u16 {
        self.remote_listen_port.load(Ordering::Acquire)
    }

    pub fn set_remote_listen_port(&self, port: u16) {
        self.remote_listen_port.store(port, Ordering::Release);
    }

    pub fn remote_public_key(&self) -> Option<PublicKey> {
        self.remote_pub.read().clone()
    }

    pub fn set_remote_public_key(&self, key: PublicKey) {
        *self.remote_pub.write() = Some(key);
    }

    pub fn session(&self) -> Option<Arc<NetworkSession>> {
        self.session.read().clone()
    }

    pub fn set_session(&self, session: Arc<NetworkSession>) {
        *self.session.write() = Some(session);
    }

    /// Queue one frame for transmission. The bytes are copied before the
    /// call returns, so the caller may reuse its buffer. Callable from any
    /// task.
    pub async fn send(&self, message: &[u8]) -> Result<(), NetError> {
        self.outbound
            .send(message.to_vec())
            .await
            .map_err(|_| NetError::ConnectionClosed)
    }

    /// Ask the event loop to tear the connection down. Idempotent: the
    /// first call fires the one-shot close signal, later calls are no-ops.
    pub fn close(&self) {
        if let Some(signal) = self.close_signal.lock().take() {
            let _ = signal.send(());
        }
    }

    /// Whether `close` has been requested on this connection.
    pub fn is_closed(&self) -> bool {
        self.close_signal.lock().is_none()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Connection({} -> {})", self.id, self.remote_addr)
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// I/O side of a connection: the inbound frame stream, the close signal,
/// and the pump task handles. Owned by whoever drives the connection (the
/// dialer during the handshake, then the event loop).
pub(crate) struct ConnectionIo {
    pub(crate) inbound: mpsc::Receiver<Vec<u8>>,
    pub(crate) close_rx: oneshot::Receiver<()>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ConnectionIo {
    /// Stop both pump tasks, dropping the socket halves.
    pub(crate) fn shutdown(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Wrap a stream socket in a [`Connection`], spawning the reader and writer
/// pumps. `remote_pub` is known up front for local dials and arrives with
/// the handshake request for accepted connections.
pub(crate) fn attach<S>(
    stream: S,
    remote_addr: SocketAddr,
    remote_pub: Option<PublicKey>,
) -> (Arc<Connection>, ConnectionIo)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let (inbound_tx, inbound_rx) = mpsc::channel::<Vec<u8>>(FRAME_QUEUE_DEPTH);
    let (outbound_tx, outbound_rx) = mpsc::channel::<Vec<u8>>(FRAME_QUEUE_DEPTH);
    let (close_tx, close_rx) = oneshot::channel();

    let conn = Arc::new(Connection {
        id: Uuid::new_v4().to_string(),
        created: SystemTime::now(),
        remote_addr,
        remote_pub: RwLock::new(remote_pub),
        remote_listen_port: AtomicU16::new(0),
        session: RwLock::new(None),
        outbound: outbound_tx,
        close_signal: Mutex::new(Some(close_tx)),
    });

    let reader = tokio::spawn(read_pump(read_half, inbound_tx, conn.id.clone()));
    let writer = tokio::spawn(write_pump(write_half, outbound_rx, conn.id.clone()));

    let io = ConnectionIo {
        inbound: inbound_rx,
        close_rx,
        reader,
        writer,
    };
    (conn, io)
}

async fn read_pump<R>(mut read_half: R, inbound: mpsc::Sender<Vec<u8>>, conn_id: String)
where
    R: AsyncRead + Unpin,
{
    loop {
        match delimited::read_frame(&mut read_half).await {
            Ok(Some(frame)) => {
                if inbound.send(frame).await.is_err() {
                    return;
                }
            }
            Ok(None) => {
                trace!("({}) inbound stream closed", conn_id);
                return;
            }
            Err(e) => {
                debug!("({}) read error: {}", conn_id, e);
                return;
            }
        }
    }
    // dropping `inbound` ends the event loop's frame stream
}

async fn write_pump<W>(mut write_half: W, mut outbound: mpsc::Receiver<Vec<u8>>, conn_id: String)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = delimited::write_frame(&mut write_half, &frame).await {
            debug!("({}) write error: {}", conn_id, e);
            return;
        }
    }
}

/// Drive one connection until it dies. A single task selects between the
/// inbound frame stream and the close signal:
///
/// - frames before a session is attached go to the handshake callback; any
///   error there kills the connection,
/// - frames after session attachment are dispatched to the shared incoming
///   channel, one detached task per frame (dispatch order across frames is
///   not guaranteed),
/// - inbound closure or an explicit `close` exits the loop.
///
/// Termination publishes the connection on `closing_tx` exactly once no
/// matter what caused it.
pub(crate) fn begin_event_processing(
    conn: Arc<Connection>,
    mut io: ConnectionIo,
    handler: Arc<dyn PreSessionHandler>,
    incoming_tx: mpsc::Sender<IncomingMessageEvent>,
    closing_tx: mpsc::Sender<Arc<Connection>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let exit = loop {
            tokio::select! {
                frame = io.inbound.recv() => match frame {
                    None => break NetError::ClosedIncomingChannel,
                    Some(message) => {
                        if conn.session().is_none() {
                            if let Err(e) = handler
                                .handle_pre_session_incoming_message(&conn, message)
                                .await
                            {
                                break NetError::PreSessionFailed(e.to_string());
                            }
                        } else {
                            let event = IncomingMessageEvent {
                                conn: conn.clone(),
                                message,
                            };
                            let tx = incoming_tx.clone();
                            tokio::spawn(async move {
                                let _ = tx.send(event).await;
                            });
                        }
                    }
                },
                _ = &mut io.close_rx => break NetError::ConnectionClosed,
            }
        };

        let peer = conn
            .remote_public_key()
            .map(|k| k.pretty())
            .unwrap_or_else(|| "?".into());
        debug!("({}) connection to {} shut down: {}", conn.id(), peer, exit);

        io.shutdown();
        let _ = closing_tx.send(conn).await;
    })
}
