//! Swarm dispatcher: the seam between the transport and the protocols.
//!
//! The swarm owns the transport and the connection pool, sequences startup
//! (inbound dispatch, clock-drift monitoring, DHT bootstrap, gossip), and
//! runs the inbound validation pipeline: every frame must carry a fresh
//! envelope, decrypt under the connection's session, bear a valid author
//! signature, and - unless it is gossip - be authored by the very peer the
//! connection is bound to. Validated payloads go to per-protocol bounded
//! queues; any validation failure closes the offending connection without
//! disturbing the others.

pub mod message;

use crate::config::Config;
use crate::dht::Dht;
use crate::gossip::Gossip;
use crate::net::connection::Connection;
use crate::net::{IncomingMessageEvent, Net};
use crate::node::{LocalNode, Node};
use crate::pool::ConnectionPool;
use crate::timesync::TimeSync;
use anyhow::{anyhow, Context, Result};
use message::{
    auth_author, new_protocol_message_metadata, prepare_message, sign_message, CommonMessageData,
    ProtocolMessage,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Queue depth of each registered protocol's delivery channel.
const PROTOCOL_QUEUE_DEPTH: usize = 100;

/// Message delivered to a protocol handler: the authenticated sender and
/// the application payload.
#[derive(Debug, Clone)]
pub struct ServiceMessage {
    pub sender: Node,
    pub data: Vec<u8>,
}

/// Inbound pipeline failures. Every variant closes the connection the
/// message arrived on.
#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("bad message format, failed to deserialize envelope")]
    BadFormatOuter,

    #[error("bad message format, failed to deserialize protocol message")]
    BadFormatInner,

    #[error("received out of sync message")]
    OutOfSync,

    #[error("no payload in message")]
    NoPayload,

    #[error("connection is missing a session")]
    NoSession,

    #[error("cannot decrypt message payload with session key")]
    DecryptFailed,

    #[error("failed to verify author")]
    AuthorFailed,

    #[error("message signed by an identity other than the sending peer")]
    NotFromPeer,

    #[error("connection carries no remote identity")]
    NoRemoteIdentity,

    #[error("received message for an unsupported protocol {0}")]
    NoProtocol(String),

    #[error("protocol handler for {0} went away")]
    HandlerGone(String),
}

/// The p2p service: registration point for protocols, origin of outbound
/// unicast and broadcast, consumer of the transport's event streams.
pub struct Swarm {
    started: AtomicBool,
    config: Config,
    local_node: Arc<LocalNode>,
    protocol_handlers: RwLock<HashMap<String, mpsc::Sender<ServiceMessage>>>,
    gossip: Arc<dyn Gossip>,
    network: Arc<Net>,
    pool: Arc<ConnectionPool>,
    dht: Arc<dyn Dht>,
    timesync: Arc<dyn TimeSync>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Swarm {
    /// Wire up a swarm: bind the transport on `local_node`'s address, build
    /// the connection pool over its event streams, and let `gossip_factory`
    /// construct the neighborhood around the pool. Nothing runs until
    /// [`Swarm::start`].
    pub async fn new(
        config: Config,
        local_node: Arc<LocalNode>,
        dht: Arc<dyn Dht>,
        timesync: Arc<dyn TimeSync>,
        gossip_factory: impl FnOnce(Arc<ConnectionPool>) -> Arc<dyn Gossip>,
    ) -> Result<Arc<Self>> {
        let network = Arc::new(Net::new(config.clone(), local_node.clone()).await?);
        let new_remote_rx = network.subscribe_new_remote_connections();
        let closing_rx = network
            .take_closing_connections()
            .ok_or_else(|| anyhow!("closing-connections stream already taken"))?;
        let pool = ConnectionPool::new(
            network.clone(),
            local_node.public_key().clone(),
            new_remote_rx,
            closing_rx,
        );
        let gossip = gossip_factory(pool.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        debug!(
            "created swarm for local node {}, {}",
            local_node.address(),
            local_node.public_key().pretty()
        );

        Ok(Arc::new(Self {
            started: AtomicBool::new(false),
            config,
            local_node,
            protocol_handlers: RwLock::new(HashMap::new()),
            gossip,
            network,
            pool,
            dht,
            timesync,
            shutdown_tx,
            shutdown_rx,
        }))
    }

    pub fn local_node(&self) -> &Arc<LocalNode> {
        &self.local_node
    }

    pub fn network(&self) -> &Arc<Net> {
        &self.network
    }

    pub fn connection_pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Start the dispatch loops and bring up the collaborators. Calling
    /// `start` on a running swarm is an error.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(anyhow!("swarm already running"));
        }
        debug!("starting the p2p layer");

        let incoming = self
            .network
            .take_incoming_messages()
            .ok_or_else(|| anyhow!("incoming-messages stream already taken"))?;
        let new_conns = self.network.subscribe_new_remote_connections();
        tokio::spawn(listen_to_network_messages(self.clone(), incoming, new_conns));
        tokio::spawn(check_time_drifts(self.clone()));

        if self.config.swarm.bootstrap {
            let begun = Instant::now();
            if let Err(e) = self.dht.bootstrap().await {
                self.shutdown();
                return Err(e).context("dht bootstrap failed");
            }
            info!(
                "dht bootstrapped with {} peers in {:?}",
                self.dht.size().await,
                begun.elapsed()
            );
            self.gossip.start().await?;
        } else {
            let gossip = self.gossip.clone();
            tokio::spawn(async move {
                if let Err(e) = gossip.start().await {
                    error!("gossip failed to start: {}", e);
                }
            });
        }
        Ok(())
    }

    /// Register a handler for `protocol`, returning its bounded delivery
    /// queue. A later registration for the same name replaces the earlier
    /// one.
    pub fn register_protocol(&self, protocol: &str) -> mpsc::Receiver<ServiceMessage> {
        let (tx, rx) = mpsc::channel(PROTOCOL_QUEUE_DEPTH);
        self.protocol_handlers.write().insert(protocol.to_string(), tx);
        rx
    }

    /// Stop the dispatch loops and shut the transport down. Pool shutdown
    /// (closing pooled connections) is the embedding application's call, as
    /// protocols may still hold connections.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.network.shutdown();
    }

    /// Send `payload` to the peer identified by `peer_pub_key` over
    /// `protocol`. Uses the gossip neighborhood's connection when the peer
    /// is a neighbor, otherwise resolves through the DHT and the pool.
    /// Blocks for as long as lookup and connection establishment take.
    pub async fn send_message(
        &self,
        peer_pub_key: &str,
        protocol: &str,
        payload: &[u8],
    ) -> Result<()> {
        let (peer, conn) = match self.gossip.peer(peer_pub_key).await {
            Some(found) => found,
            None => {
                let peer = self.dht.lookup(peer_pub_key).await?;
                let conn = self
                    .pool
                    .get_connection(peer.address(), peer.public_key())
                    .await
                    .map_err(|e| {
                        warn!("failed to send message to {}, no valid connection: {}", peer, e);
                        e
                    })?;
                (peer, conn)
            }
        };

        let session = conn
            .session()
            .ok_or_else(|| anyhow!("failed to send message to {}, no valid session", peer))?;

        let mut protocol_message = ProtocolMessage {
            metadata: new_protocol_message_metadata(self.local_node.public_key(), protocol, false),
            payload: payload.to_vec(),
        };
        sign_message(self.local_node.keys(), &mut protocol_message)?;
        // the signature must verify locally before it leaves the node
        auth_author(&protocol_message)?;

        let data = bincode::serialize(&protocol_message).context("failed to encode signed message")?;
        let sealed = prepare_message(&session, &data).context("failed to prepare message to send")?;
        conn.send(&sealed).await?;
        Ok(())
    }

    /// Author a gossip message for `protocol` and hand it to the overlay.
    /// The message is signed but not encrypted; the overlay re-encrypts per
    /// hop with each neighbor session.
    pub async fn broadcast(&self, protocol: &str, payload: &[u8]) -> Result<()> {
        let mut protocol_message = ProtocolMessage {
            metadata: new_protocol_message_metadata(self.local_node.public_key(), protocol, true),
            payload: payload.to_vec(),
        };
        sign_message(self.local_node.keys(), &mut protocol_message)?;
        let data = bincode::serialize(&protocol_message).context("failed to encode gossip message")?;
        self.gossip.broadcast(data).await
    }

    async fn process_message(&self, event: IncomingMessageEvent) {
        if *self.shutdown_rx.borrow() {
            return;
        }
        if let Err(e) = self.on_remote_client_message(&event).await {
            error!(
                "error handling message from {:?}, closing connection: {}",
                event.conn.remote_public_key().map(|k| k.pretty()),
                e
            );
            event.conn.close();
        }
    }

    /// The inbound pipeline. Validates one frame end to end and routes the
    /// payload to its protocol queue. Any `Err` makes the caller close the
    /// connection the frame arrived on.
    async fn on_remote_client_message(
        &self,
        event: &IncomingMessageEvent,
    ) -> Result<(), SwarmError> {
        let envelope: CommonMessageData =
            bincode::deserialize(&event.message).map_err(|_| SwarmError::BadFormatOuter)?;

        // reject replayed or badly-stamped traffic before touching the payload
        if !self.timesync.check_message_drift(envelope.timestamp) {
            return Err(SwarmError::OutOfSync);
        }

        if envelope.payload.is_empty() {
            return Err(SwarmError::NoPayload);
        }

        let session = event.conn.session().ok_or(SwarmError::NoSession)?;
        let decrypted = session
            .decrypt(&envelope.payload)
            .map_err(|_| SwarmError::DecryptFailed)?;

        let protocol_message: ProtocolMessage =
            bincode::deserialize(&decrypted).map_err(|_| SwarmError::BadFormatInner)?;

        // the session authenticated the sender; this authenticates the author
        auth_author(&protocol_message).map_err(|_| SwarmError::AuthorFailed)?;

        let remote_pub = event
            .conn
            .remote_public_key()
            .ok_or(SwarmError::NoRemoteIdentity)?;
        if !protocol_message.metadata.gossip
            && protocol_message.metadata.author_pub_key != remote_pub.to_vec()
        {
            // a direct message must be authored by the connection's peer
            return Err(SwarmError::NotFromPeer);
        }

        debug!("authorized {} protocol message", protocol_message.metadata.protocol);

        let remote_node = Node::new(
            remote_pub,
            format!(
                "{}:{}",
                event.conn.remote_addr().ip(),
                event.conn.remote_listen_port()
            ),
        );
        // we just heard from this authenticated node
        self.dht.update(remote_node.clone()).await;

        if protocol_message.metadata.gossip {
            debug!("got gossip message, relaying");
            if self.gossip.broadcast(decrypted).await.is_err() {
                // already seen and delivered on an earlier arrival
                return Ok(());
            }
        }

        let handler = self
            .protocol_handlers
            .read()
            .get(&protocol_message.metadata.protocol)
            .cloned();
        let handler = match handler {
            Some(handler) => handler,
            None => {
                error!("received message for unregistered protocol {}", protocol_message.metadata.protocol);
                return Err(SwarmError::NoProtocol(protocol_message.metadata.protocol));
            }
        };
        handler
            .send(ServiceMessage {
                sender: remote_node,
                data: protocol_message.payload,
            })
            .await
            .map_err(|_| SwarmError::HandlerGone(protocol_message.metadata.protocol))
    }

    /// Record a freshly established connection in the routing table.
    async fn update_connection(&self, conn: Arc<Connection>) {
        if let Some(remote_pub) = conn.remote_public_key() {
            let address = format!("{}:{}", conn.remote_addr().ip(), conn.remote_listen_port());
            self.dht.update(Node::new(remote_pub, address)).await;
        }
    }
}

/// Inbound dispatch loop. Each message is handled on its own task so one
/// slow protocol queue cannot head-of-line block the rest; consequently
/// handlers may observe messages from a single connection out of wire
/// order.
async fn listen_to_network_messages(
    swarm: Arc<Swarm>,
    mut incoming: mpsc::Receiver<IncomingMessageEvent>,
    mut new_conns: mpsc::Receiver<Arc<Connection>>,
) {
    let mut shutdown = swarm.shutdown_rx.clone();
    loop {
        tokio::select! {
            Some(event) = incoming.recv() => {
                let swarm = swarm.clone();
                tokio::spawn(async move { swarm.process_message(event).await });
            }
            Some(conn) = new_conns.recv() => {
                let swarm = swarm.clone();
                tokio::spawn(async move { swarm.update_connection(conn).await });
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Periodic system-clock sanity loop. A clock the node cannot trust takes
/// the whole swarm down.
async fn check_time_drifts(swarm: Arc<Swarm>) {
    let mut ticker = tokio::time::interval(swarm.config.swarm.refresh_ntp_interval);
    // interval fires immediately once; swallow that so checks are spaced
    ticker.tick().await;
    let mut shutdown = swarm.shutdown_rx.clone();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if let Err(e) = swarm.timesync.check_system_clock_drift() {
                    error!("system time could not synchronize: {}", e);
                    swarm.shutdown();
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timesync::SystemTimeSync;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct MapDht {
        nodes: Mutex<HashMap<String, Node>>,
    }

    impl MapDht {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                nodes: Mutex::new(HashMap::new()),
            })
        }
    }

    #[async_trait]
    impl Dht for MapDht {
        async fn update(&self, node: Node) {
            self.nodes
                .lock()
                .insert(node.public_key().to_string_key(), node);
        }

        async fn lookup(&self, public_key: &str) -> Result<Node> {
            self.nodes
                .lock()
                .get(public_key)
                .cloned()
                .ok_or_else(|| anyhow!("unknown peer"))
        }

        async fn bootstrap(&self) -> Result<()> {
            Ok(())
        }

        async fn size(&self) -> usize {
            self.nodes.lock().len()
        }
    }

    struct RecordingGossip {
        broadcasts: Mutex<Vec<Vec<u8>>>,
        reject_as_duplicate: bool,
    }

    impl RecordingGossip {
        fn new(reject_as_duplicate: bool) -> Arc<Self> {
            Arc::new(Self {
                broadcasts: Mutex::new(Vec::new()),
                reject_as_duplicate,
            })
        }
    }

    #[async_trait]
    impl Gossip for RecordingGossip {
        async fn start(&self) -> Result<()> {
            Ok(())
        }

        async fn peer(&self, _public_key: &str) -> Option<(Node, Arc<Connection>)> {
            None
        }

        async fn broadcast(&self, payload: Vec<u8>) -> Result<()> {
            self.broadcasts.lock().push(payload);
            if self.reject_as_duplicate {
                anyhow::bail!("message already seen")
            }
            Ok(())
        }
    }

    struct FrozenClock;

    impl crate::timesync::TimeSync for FrozenClock {
        fn check_message_drift(&self, _timestamp_ms: i64) -> bool {
            false
        }

        fn check_system_clock_drift(&self) -> Result<Duration> {
            Ok(Duration::ZERO)
        }
    }

    struct TestPeer {
        swarm: Arc<Swarm>,
        dht: Arc<MapDht>,
        gossip: Arc<RecordingGossip>,
    }

    async fn build_peer(timesync: Arc<dyn TimeSync>, duplicate_gossip: bool) -> TestPeer {
        let config = Config::default();
        let local = Arc::new(LocalNode::new(&config));
        let dht = MapDht::new();
        let gossip = RecordingGossip::new(duplicate_gossip);
        let gossip_obj: Arc<dyn Gossip> = gossip.clone();
        let swarm = Swarm::new(config, local, dht.clone(), timesync, move |_pool| gossip_obj)
            .await
            .unwrap();
        TestPeer { swarm, dht, gossip }
    }

    /// Dial `to` from `from` and hand back both ends of the link.
    async fn connect(from: &TestPeer, to: &TestPeer) -> (Arc<Connection>, Arc<Connection>) {
        let mut accepted_rx = to.swarm.network().subscribe_new_remote_connections();
        let dialed = from
            .swarm
            .network()
            .dial(
                &to.swarm.network().local_addr().to_string(),
                to.swarm.local_node().public_key().clone(),
            )
            .await
            .unwrap();
        let accepted = accepted_rx.recv().await.unwrap();
        (dialed, accepted)
    }

    fn sealed_message(
        author: &crate::identity::KeyPair,
        sender_conn: &Arc<Connection>,
        protocol: &str,
        gossip: bool,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut protocol_message = ProtocolMessage {
            metadata: new_protocol_message_metadata(author.public(), protocol, gossip),
            payload: payload.to_vec(),
        };
        sign_message(author, &mut protocol_message).unwrap();
        let data = bincode::serialize(&protocol_message).unwrap();
        prepare_message(&sender_conn.session().unwrap(), &data).unwrap()
    }

    fn fresh_identity() -> crate::identity::KeyPair {
        crate::identity::KeyPair::generate()
    }

    #[tokio::test]
    async fn valid_message_reaches_handler_and_updates_dht() {
        let alice = build_peer(Arc::new(SystemTimeSync::new()), false).await;
        let bob = build_peer(Arc::new(SystemTimeSync::new()), false).await;
        let mut echo = bob.swarm.register_protocol("echo");
        let (a_conn, b_conn) = connect(&alice, &bob).await;

        let sealed = sealed_message(
            alice.swarm.local_node().keys(),
            &a_conn,
            "echo",
            false,
            b"hi",
        );
        let event = IncomingMessageEvent {
            conn: b_conn,
            message: sealed,
        };
        bob.swarm.on_remote_client_message(&event).await.unwrap();

        let delivered = echo.recv().await.unwrap();
        assert_eq!(delivered.data, b"hi");
        assert_eq!(
            delivered.sender.public_key(),
            alice.swarm.local_node().public_key()
        );
        // the routing table heard about alice at her listen address
        assert_eq!(bob.dht.size().await, 1);
        let known = bob
            .dht
            .lookup(&alice.swarm.local_node().public_key().to_string_key())
            .await
            .unwrap();
        assert!(known
            .address()
            .ends_with(&alice.swarm.network().local_addr().port().to_string()));
    }

    #[tokio::test]
    async fn wrong_author_is_rejected() {
        let alice = build_peer(Arc::new(SystemTimeSync::new()), false).await;
        let bob = build_peer(Arc::new(SystemTimeSync::new()), false).await;
        let _echo = bob.swarm.register_protocol("echo");
        let (a_conn, b_conn) = connect(&alice, &bob).await;

        // correctly signed, but by an identity that is not the peer
        let mallory = fresh_identity();
        let sealed = sealed_message(&mallory, &a_conn, "echo", false, b"hi");
        let event = IncomingMessageEvent {
            conn: b_conn,
            message: sealed,
        };
        let err = bob.swarm.on_remote_client_message(&event).await.unwrap_err();
        assert!(matches!(err, SwarmError::NotFromPeer));
    }

    #[tokio::test]
    async fn gossip_author_may_differ_from_peer() {
        let alice = build_peer(Arc::new(SystemTimeSync::new()), false).await;
        let bob = build_peer(Arc::new(SystemTimeSync::new()), false).await;
        let mut blocks = bob.swarm.register_protocol("blocks");
        let (a_conn, b_conn) = connect(&alice, &bob).await;

        let originator = fresh_identity();
        let sealed = sealed_message(&originator, &a_conn, "blocks", true, b"block 42");
        let event = IncomingMessageEvent {
            conn: b_conn,
            message: sealed,
        };
        bob.swarm.on_remote_client_message(&event).await.unwrap();

        // relayed onward and delivered locally
        assert_eq!(bob.gossip.broadcasts.lock().len(), 1);
        assert_eq!(blocks.recv().await.unwrap().data, b"block 42");
    }

    #[tokio::test]
    async fn duplicate_gossip_is_swallowed_without_delivery() {
        let alice = build_peer(Arc::new(SystemTimeSync::new()), false).await;
        let bob = build_peer(Arc::new(SystemTimeSync::new()), true).await;
        let mut blocks = bob.swarm.register_protocol("blocks");
        let (a_conn, b_conn) = connect(&alice, &bob).await;

        let originator = fresh_identity();
        let sealed = sealed_message(&originator, &a_conn, "blocks", true, b"block 42");
        let event = IncomingMessageEvent {
            conn: b_conn,
            message: sealed,
        };
        // duplicate suppression is not an error
        bob.swarm.on_remote_client_message(&event).await.unwrap();
        assert!(blocks.try_recv().is_err());
    }

    #[tokio::test]
    async fn stale_timestamp_is_rejected() {
        let alice = build_peer(Arc::new(SystemTimeSync::new()), false).await;
        let bob = build_peer(Arc::new(FrozenClock), false).await;
        let _echo = bob.swarm.register_protocol("echo");
        let (a_conn, b_conn) = connect(&alice, &bob).await;

        let sealed = sealed_message(
            alice.swarm.local_node().keys(),
            &a_conn,
            "echo",
            false,
            b"hi",
        );
        let event = IncomingMessageEvent {
            conn: b_conn,
            message: sealed,
        };
        let err = bob.swarm.on_remote_client_message(&event).await.unwrap_err();
        assert!(matches!(err, SwarmError::OutOfSync));
    }

    #[tokio::test]
    async fn unregistered_protocol_is_rejected() {
        let alice = build_peer(Arc::new(SystemTimeSync::new()), false).await;
        let bob = build_peer(Arc::new(SystemTimeSync::new()), false).await;
        let (a_conn, b_conn) = connect(&alice, &bob).await;

        let sealed = sealed_message(
            alice.swarm.local_node().keys(),
            &a_conn,
            "nobody-home",
            false,
            b"hi",
        );
        let event = IncomingMessageEvent {
            conn: b_conn,
            message: sealed,
        };
        let err = bob.swarm.on_remote_client_message(&event).await.unwrap_err();
        assert!(matches!(err, SwarmError::NoProtocol(_)));
    }

    #[tokio::test]
    async fn garbage_frame_is_rejected() {
        let alice = build_peer(Arc::new(SystemTimeSync::new()), false).await;
        let bob = build_peer(Arc::new(SystemTimeSync::new()), false).await;
        let (_a_conn, b_conn) = connect(&alice, &bob).await;

        let event = IncomingMessageEvent {
            conn: b_conn,
            message: b"definitely not bincode".to_vec(),
        };
        let err = bob.swarm.on_remote_client_message(&event).await.unwrap_err();
        assert!(matches!(err, SwarmError::BadFormatOuter));
    }

    #[tokio::test]
    async fn empty_payload_is_rejected() {
        let alice = build_peer(Arc::new(SystemTimeSync::new()), false).await;
        let bob = build_peer(Arc::new(SystemTimeSync::new()), false).await;
        let (_a_conn, b_conn) = connect(&alice, &bob).await;

        let envelope = CommonMessageData {
            timestamp: crate::timesync::now_millis(),
            payload: Vec::new(),
        };
        let event = IncomingMessageEvent {
            conn: b_conn,
            message: bincode::serialize(&envelope).unwrap(),
        };
        let err = bob.swarm.on_remote_client_message(&event).await.unwrap_err();
        assert!(matches!(err, SwarmError::NoPayload));
    }

    #[tokio::test]
    async fn broadcast_signs_and_hands_to_gossip() {
        let alice = build_peer(Arc::new(SystemTimeSync::new()), false).await;
        alice.swarm.broadcast("blocks", b"block 7").await.unwrap();

        let recorded = alice.gossip.broadcasts.lock();
        assert_eq!(recorded.len(), 1);
        let message: ProtocolMessage = bincode::deserialize(&recorded[0]).unwrap();
        assert!(message.metadata.gossip);
        assert_eq!(message.payload, b"block 7");
        assert!(auth_author(&message).is_ok());
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let alice = build_peer(Arc::new(SystemTimeSync::new()), false).await;
        alice.swarm.start().await.unwrap();
        assert!(alice.swarm.start().await.is_err());
        alice.swarm.shutdown();
    }
}
