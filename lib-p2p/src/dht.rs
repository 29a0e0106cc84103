//! Routing table seam.
//!
//! The Kademlia-style routing table lives outside this crate; the swarm only
//! needs the four operations below. `update` is called on every successful
//! authenticated receive, `lookup` resolves a public key to a dial address
//! for outbound sends, and `bootstrap` runs once at startup when enabled.

use crate::node::Node;
use anyhow::Result;
use async_trait::async_trait;

/// Routing table operations consumed by the swarm.
#[async_trait]
pub trait Dht: Send + Sync {
    /// Record that `node` was heard from at its current address.
    async fn update(&self, node: Node);

    /// Resolve a peer's dial address. May issue network lookups and block
    /// for their duration.
    async fn lookup(&self, public_key: &str) -> Result<Node>;

    /// Join the network by contacting configured bootstrap nodes.
    async fn bootstrap(&self) -> Result<()>;

    /// Number of known peers.
    async fn size(&self) -> usize;
}
