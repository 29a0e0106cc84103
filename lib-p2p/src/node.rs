//! Node descriptors.

use crate::config::Config;
use crate::identity::{KeyPair, PublicKey};
use std::fmt;

/// A known peer: public key plus `host:port` dial address.
///
/// Equality and hashing go by public key only; the address is routing
/// metadata that may change as the peer moves.
#[derive(Clone)]
pub struct Node {
    public_key: PublicKey,
    address: String,
}

impl Node {
    pub fn new(public_key: PublicKey, address: String) -> Self {
        Self { public_key, address }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.public_key == other.public_key
    }
}

impl Eq for Node {}

impl std::hash::Hash for Node {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.public_key.hash(state);
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({} @ {})", self.public_key.pretty(), self.address)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.public_key.pretty(), self.address)
    }
}

/// The local node: identity keypair plus listen address.
///
/// Creating or loading the identity from disk is the embedding application's
/// concern; this type only carries an identity that already exists.
pub struct LocalNode {
    keys: KeyPair,
    address: String,
    network_id: i8,
}

impl LocalNode {
    /// Build a local node with a freshly generated identity, listening on
    /// loopback at `config.tcp_port` (port 0 binds an ephemeral port).
    pub fn new(config: &Config) -> Self {
        Self::with_address(config, format!("127.0.0.1:{}", config.tcp_port))
    }

    /// Build a local node on an explicit `host:port` listen address instead
    /// of the one derived from `config.tcp_port`.
    pub fn with_address(config: &Config, address: String) -> Self {
        Self {
            keys: KeyPair::generate(),
            address,
            network_id: config.network_id,
        }
    }

    /// Build a local node around an existing identity.
    pub fn with_keys(config: &Config, address: String, keys: KeyPair) -> Self {
        Self {
            keys,
            address,
            network_id: config.network_id,
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        self.keys.public()
    }

    pub fn keys(&self) -> &KeyPair {
        &self.keys
    }

    /// Listen address in `host:port` form.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn network_id(&self) -> i8 {
        self.network_id
    }

    /// Descriptor of this node as peers see it.
    pub fn as_node(&self) -> Node {
        Node::new(self.keys.public().clone(), self.address.clone())
    }
}

impl fmt::Debug for LocalNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalNode({} @ {})", self.public_key().pretty(), self.address)
    }
}
