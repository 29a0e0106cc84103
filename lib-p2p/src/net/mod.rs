//! Transport layer: TCP listener and dialer producing secured connections.
//!
//! `Net` owns the listening socket. Locally-initiated connections come from
//! [`Net::dial`], which runs the full secured-dial sequence before handing
//! the connection back. Remote-initiated connections are accepted, handshook
//! on their first frame, and then published to every subscriber of
//! [`Net::subscribe_new_remote_connections`]. Post-session frames from all
//! connections funnel into one shared incoming channel; teardown events
//! funnel into one shared closing channel.

pub mod connection;
pub mod delimited;
pub mod handshake;
pub mod session;

use crate::config::Config;
use crate::identity::PublicKey;
use crate::node::LocalNode;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use connection::{begin_event_processing, Connection, ConnectionIo};
use handshake::{HandshakeError, HandshakeRequest, HandshakeResponse};
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

/// Queue depth of each new-remote-connection subscriber channel.
const SUBSCRIBER_QUEUE_DEPTH: usize = 20;

/// Queue depth of the shared closing-connections channel.
const CLOSING_QUEUE_DEPTH: usize = 20;

/// Queue depth of the shared incoming-message channel.
const INCOMING_QUEUE_DEPTH: usize = 64;

/// Event reported for every post-session frame: the payload and the
/// connection that carried it.
#[derive(Debug)]
pub struct IncomingMessageEvent {
    pub conn: Arc<Connection>,
    pub message: Vec<u8>,
}

/// Callback a connection's event loop uses for frames that arrive before a
/// session is attached. Implemented by the transport; the indirection keeps
/// connections from holding a full `Net` back-pointer.
#[async_trait]
pub trait PreSessionHandler: Send + Sync {
    async fn handle_pre_session_incoming_message(
        &self,
        conn: &Arc<Connection>,
        message: Vec<u8>,
    ) -> Result<()>;
}

#[derive(Debug, Error)]
pub enum NetError {
    #[error("network is shutting down")]
    Shutdown,

    #[error("tcp connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("waiting for handshake response timed out")]
    HandshakeTimeout,

    #[error("failed to establish secured connection: {0}")]
    HandshakeFailed(#[from] HandshakeError),

    #[error("unexpected closed incoming channel")]
    ClosedIncomingChannel,

    #[error("connection was intentionally closed")]
    ConnectionClosed,

    #[error("failed to handle handshake request: {0}")]
    PreSessionFailed(String),

    #[error("bad address: {0}")]
    BadAddress(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

struct NetInner {
    network_id: i8,
    local_node: Arc<LocalNode>,
    /// Listen port advertised to peers in handshakes.
    port: u16,
    config: Config,
    subscribers: RwLock<Vec<mpsc::Sender<Arc<Connection>>>>,
    incoming_tx: mpsc::Sender<IncomingMessageEvent>,
    closing_tx: mpsc::Sender<Arc<Connection>>,
    shutting_down: AtomicBool,
    shutdown_signal: Notify,
}

/// Connection factory: a TCP server plus a TCP client sharing one identity.
///
/// `Net` knows nothing of pools, routing tables or protocols; it hands out
/// connections and event streams and leaves policy to its callers.
pub struct Net {
    inner: Arc<NetInner>,
    local_addr: SocketAddr,
    incoming_rx: Mutex<Option<mpsc::Receiver<IncomingMessageEvent>>>,
    closing_rx: Mutex<Option<mpsc::Receiver<Arc<Connection>>>>,
}

impl Net {
    /// Bind the listen address from `local_node` and start accepting.
    pub async fn new(config: Config, local_node: Arc<LocalNode>) -> Result<Self> {
        let listener = TcpListener::bind(local_node.address())
            .await
            .with_context(|| format!("failed to listen on {}", local_node.address()))?;
        let local_addr = listener.local_addr()?;

        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE_DEPTH);
        let (closing_tx, closing_rx) = mpsc::channel(CLOSING_QUEUE_DEPTH);

        let inner = Arc::new(NetInner {
            network_id: local_node.network_id(),
            local_node,
            port: local_addr.port(),
            config,
            subscribers: RwLock::new(Vec::new()),
            incoming_tx,
            closing_tx,
            shutting_down: AtomicBool::new(false),
            shutdown_signal: Notify::new(),
        });

        tokio::spawn(accept_loop(listener, inner.clone()));
        info!("listening on {}", local_addr);

        Ok(Self {
            inner,
            local_addr,
            incoming_rx: Mutex::new(Some(incoming_rx)),
            closing_rx: Mutex::new(Some(closing_rx)),
        })
    }

    pub fn network_id(&self) -> i8 {
        self.inner.network_id
    }

    pub fn local_node(&self) -> &Arc<LocalNode> {
        &self.inner.local_node
    }

    /// Actual bound listen address (resolves port 0 to the ephemeral port).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The shared post-session frame stream. Single consumer: the first
    /// caller takes the receiver.
    pub fn take_incoming_messages(&self) -> Option<mpsc::Receiver<IncomingMessageEvent>> {
        self.incoming_rx.lock().take()
    }

    /// The shared teardown stream. Single consumer: the first caller takes
    /// the receiver.
    pub fn take_closing_connections(&self) -> Option<mpsc::Receiver<Arc<Connection>>> {
        self.closing_rx.lock().take()
    }

    /// Register for remote-initiated connections. Every subscriber gets its
    /// own bounded channel and sees every remote connection after its
    /// handshake completes. Local dials are not published here; the dialer
    /// already holds the connection.
    pub fn subscribe_new_remote_connections(&self) -> mpsc::Receiver<Arc<Connection>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        self.inner.subscribers.write().push(tx);
        rx
    }

    /// Dial `address` expecting the peer identified by `remote_public_key`.
    /// Runs the secured-dial sequence and starts the connection's event
    /// loop on success.
    pub async fn dial(
        &self,
        address: &str,
        remote_public_key: PublicKey,
    ) -> Result<Arc<Connection>, NetError> {
        let (conn, io) = self.create_secured_connection(address, remote_public_key).await?;
        begin_event_processing(
            conn.clone(),
            io,
            self.inner.clone(),
            self.inner.incoming_tx.clone(),
            self.inner.closing_tx.clone(),
        );
        Ok(conn)
    }

    async fn create_secured_connection(
        &self,
        address: &str,
        remote_public_key: PublicKey,
    ) -> Result<(Arc<Connection>, ConnectionIo), NetError> {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(NetError::Shutdown);
        }

        let dial_timeout = self.inner.config.dial_timeout;
        debug!("tcp dialing {} ...", address);
        let stream = tokio::time::timeout(dial_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| NetError::ConnectTimeout(dial_timeout))??;
        configure_keep_alive(&stream, self.inner.config.conn_keep_alive);
        let remote_addr = stream.peer_addr()?;

        // the peer's listen port is right there in the dial address
        let listen_port = address
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse::<u16>().ok())
            .ok_or_else(|| NetError::BadAddress(address.to_string()))?;

        let (conn, mut io) = connection::attach(stream, remote_addr, Some(remote_public_key.clone()));

        let (request, session) = handshake::generate_handshake_request(
            self.inner.local_node.keys(),
            &remote_public_key,
            self.inner.network_id,
            self.inner.port,
        )?;
        debug!(
            "({}) sending handshake request, session {}",
            conn.id(),
            hex::encode(session.id())
        );
        let payload = bincode::serialize(&request)
            .map_err(|e| HandshakeError::Serialization(e.to_string()))?;
        if let Err(e) = conn.send(&payload).await {
            io.shutdown();
            return Err(e);
        }

        let response_timeout = self.inner.config.response_timeout;
        let frame = match tokio::time::timeout(response_timeout, io.inbound.recv()).await {
            Err(_) => {
                info!(
                    "waiting for handshake response timed out, peer {}",
                    remote_public_key.pretty()
                );
                io.shutdown();
                return Err(NetError::HandshakeTimeout);
            }
            Ok(None) => {
                io.shutdown();
                return Err(NetError::ClosedIncomingChannel);
            }
            Ok(Some(frame)) => frame,
        };

        let response: HandshakeResponse = match bincode::deserialize(&frame) {
            Ok(response) => response,
            Err(e) => {
                io.shutdown();
                return Err(HandshakeError::Serialization(e.to_string()).into());
            }
        };
        if let Err(e) = handshake::process_handshake_response(&remote_public_key, &session, &response)
        {
            io.shutdown();
            return Err(e.into());
        }

        conn.set_session(Arc::new(session));
        conn.set_remote_listen_port(listen_port);
        Ok((conn, io))
    }

    /// Stop accepting new connections and close the listener. Established
    /// connections are left to their owners (the pool closes its own on
    /// shutdown).
    pub fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::Release);
        self.inner.shutdown_signal.notify_one();
    }
}

async fn accept_loop(listener: TcpListener, inner: Arc<NetInner>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, remote_addr)) => {
                        debug!("accepted connection from {}", remote_addr);
                        configure_keep_alive(&stream, inner.config.conn_keep_alive);
                        let (conn, io) = connection::attach(stream, remote_addr, None);
                        begin_event_processing(
                            conn,
                            io,
                            inner.clone(),
                            inner.incoming_tx.clone(),
                            inner.closing_tx.clone(),
                        );
                        // not published yet: the remote node must establish
                        // a session first
                    }
                    Err(e) => {
                        if !inner.shutting_down.load(Ordering::Acquire) {
                            error!("failed to accept connection: {}", e);
                        }
                        return;
                    }
                }
            }
            _ = inner.shutdown_signal.notified() => {
                debug!("accept loop exiting");
                return;
            }
        }
    }
}

#[async_trait]
impl PreSessionHandler for NetInner {
    /// Treat the first frame on an accepted connection as a handshake
    /// request: derive the session, answer with the response frame, and
    /// publish the connection to subscribers.
    async fn handle_pre_session_incoming_message(
        &self,
        conn: &Arc<Connection>,
        message: Vec<u8>,
    ) -> Result<()> {
        let request: HandshakeRequest = bincode::deserialize(&message)
            .map_err(|e| anyhow!("failed to handle handshake request: {}", e))?;

        // a remote connection has no public key until its handshake arrives
        if conn.remote_public_key().is_none() {
            let remote_pub = PublicKey::from_bytes(&request.node_pub_key)
                .context("failed to handle handshake request")?;
            debug!("handling handshake request from {}", remote_pub.pretty());
            conn.set_remote_public_key(remote_pub);
        }
        let remote_pub = conn
            .remote_public_key()
            .ok_or_else(|| anyhow!("connection lost its remote key"))?;

        let (response, session) = handshake::process_handshake_request(
            self.network_id,
            self.local_node.keys(),
            self.port,
            &remote_pub,
            &request,
        )?;
        let payload = bincode::serialize(&response)
            .map_err(|e| anyhow!("failed to serialize handshake response: {}", e))?;
        conn.send(&payload).await?;

        conn.set_session(Arc::new(session));
        conn.set_remote_listen_port(request.port);

        let subscribers: Vec<mpsc::Sender<Arc<Connection>>> =
            self.subscribers.read().iter().cloned().collect();
        for subscriber in subscribers {
            if subscriber.send(conn.clone()).await.is_err() {
                warn!("new-remote-connection subscriber went away");
            }
        }
        Ok(())
    }
}

fn configure_keep_alive(stream: &TcpStream, period: Duration) {
    let keep_alive = socket2::TcpKeepalive::new().with_time(period);
    let sock = socket2::SockRef::from(stream);
    if let Err(e) = sock.set_tcp_keepalive(&keep_alive) {
        // drop-after-idle is an optimization, not a correctness requirement
        warn!("failed to set tcp keep-alive: {}", e);
    }
}
