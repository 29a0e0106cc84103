//! Configuration for the p2p layer.
//!
//! All fields have working defaults so `Config::default()` produces a node
//! that listens on an ephemeral port on the default network. Loading from a
//! file or flags is the embedding application's concern; the types here only
//! need to deserialize.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level p2p configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network identifier. Handshakes between nodes configured with
    /// different network ids are rejected.
    pub network_id: i8,

    /// TCP listen port. 0 binds an ephemeral port.
    pub tcp_port: u16,

    /// Maximum time to wait for a TCP connect to a remote peer.
    pub dial_timeout: Duration,

    /// Maximum time to wait for the handshake response frame on a
    /// locally-initiated connection.
    pub response_timeout: Duration,

    /// TCP keep-alive period for established connections.
    pub conn_keep_alive: Duration,

    /// Swarm-level settings.
    pub swarm: SwarmConfig,
}

/// Settings consumed by the swarm dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    /// Bootstrap the DHT on startup. A bootstrap failure is fatal.
    pub bootstrap: bool,

    /// Interval between system-clock drift checks.
    pub refresh_ntp_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network_id: 0,
            tcp_port: 0,
            dial_timeout: Duration::from_secs(60),
            response_timeout: Duration::from_secs(15),
            conn_keep_alive: Duration::from_secs(48 * 60 * 60),
            swarm: SwarmConfig::default(),
        }
    }
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            bootstrap: false,
            refresh_ntp_interval: Duration::from_secs(5 * 60),
        }
    }
}
