//! Peer-to-peer networking substrate
//!
//! This crate implements the core transport stack for a decentralized node:
//!
//! - **`net`** - TCP listener/dialer producing authenticated, encrypted,
//!   length-delimited connections. A two-frame handshake binds a symmetric
//!   session to both endpoints before any application traffic flows.
//! - **`pool`** - connection pool keyed by remote public key. Coalesces
//!   concurrent dials to the same peer and reconciles locally-initiated
//!   connections with connections initiated by the remote side.
//! - **`swarm`** - dispatcher that authenticates every inbound message
//!   (timestamp freshness, author signature, transport-peer binding) and
//!   routes payloads to registered protocol handlers. Also the entry point
//!   for unicast sends and gossip broadcasts.
//!
//! The DHT routing table and the gossip neighborhood are external
//! collaborators reached through the [`dht::Dht`] and [`gossip::Gossip`]
//! traits. Node identity persistence is likewise out of scope: callers hand
//! the swarm an already-loaded [`node::LocalNode`].

pub mod config;
pub mod dht;
pub mod gossip;
pub mod identity;
pub mod node;
pub mod pool;
pub mod swarm;
pub mod timesync;

pub mod net;

pub use config::{Config, SwarmConfig};
pub use identity::{KeyPair, PublicKey};
pub use net::connection::Connection;
pub use net::{IncomingMessageEvent, Net};
pub use node::{LocalNode, Node};
pub use pool::ConnectionPool;
pub use swarm::Swarm;
