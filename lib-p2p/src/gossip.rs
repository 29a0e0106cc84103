//! Gossip neighborhood seam.
//!
//! Broadcast dissemination runs in an external overlay. The swarm hands it
//! signed protocol messages for fan-out and consults it for neighbor
//! connections before falling back to a DHT lookup.

use crate::net::connection::Connection;
use crate::node::Node;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Gossip overlay operations consumed by the swarm.
#[async_trait]
pub trait Gossip: Send + Sync {
    /// Start the neighborhood (peer selection, re-dissemination loops).
    async fn start(&self) -> Result<()>;

    /// If `public_key` is a current neighbor, return its descriptor and the
    /// live connection to it.
    async fn peer(&self, public_key: &str) -> Option<(Node, Arc<Connection>)>;

    /// Disseminate `payload` to the neighborhood. An `Err` from an item that
    /// was already seen is a duplicate-suppression signal, not a failure;
    /// callers are expected to swallow it.
    async fn broadcast(&self, payload: Vec<u8>) -> Result<()>;
}
