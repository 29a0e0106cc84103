//! Protocol message wire shapes and the signing/sealing helpers.
//!
//! A protocol message travels double-wrapped: the signed `ProtocolMessage`
//! is serialized, encrypted with the connection's session, and carried as
//! the payload of a `CommonMessageData` envelope whose timestamp gates
//! freshness on the receiving side. Signing canonicalizes the message with
//! the signature field zeroed.

use crate::identity::{KeyPair, PublicKey};
use crate::net::session::NetworkSession;
use crate::timesync;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Outer envelope: cleartext timestamp plus the encrypted protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonMessageData {
    /// Unix milliseconds at send time.
    pub timestamp: i64,
    pub payload: Vec<u8>,
}

/// Authenticated application message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolMessage {
    pub metadata: ProtocolMessageMetadata,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolMessageMetadata {
    /// Identity key of the message author. For gossip messages this is the
    /// originator, not the relaying peer.
    pub author_pub_key: Vec<u8>,
    /// Name of the protocol handler this message addresses.
    pub protocol: String,
    /// Unix milliseconds at authoring time.
    pub timestamp: i64,
    /// Whether this message travels the gossip overlay.
    pub gossip: bool,
    /// Author signature over the canonical form (this field zeroed).
    pub auth_signature: Vec<u8>,
}

/// Fresh metadata for a message authored by `author` now.
pub fn new_protocol_message_metadata(
    author: &PublicKey,
    protocol: &str,
    gossip: bool,
) -> ProtocolMessageMetadata {
    ProtocolMessageMetadata {
        author_pub_key: author.to_vec(),
        protocol: protocol.to_string(),
        timestamp: timesync::now_millis(),
        gossip,
        auth_signature: Vec::new(),
    }
}

fn canonical_bytes(message: &ProtocolMessage) -> Result<Vec<u8>> {
    let mut unsigned = message.clone();
    unsigned.metadata.auth_signature.clear();
    bincode::serialize(&unsigned).context("failed to canonicalize protocol message")
}

/// Sign `message` in place with the author's identity key.
pub fn sign_message(keys: &KeyPair, message: &mut ProtocolMessage) -> Result<()> {
    let canonical = canonical_bytes(message)?;
    message.metadata.auth_signature = keys.sign(&canonical);
    Ok(())
}

/// Verify the author signature carried in `message.metadata`.
pub fn auth_author(message: &ProtocolMessage) -> Result<()> {
    let author = PublicKey::from_bytes(&message.metadata.author_pub_key)
        .context("message carries an invalid author key")?;
    let canonical = canonical_bytes(message)?;
    author
        .verify(&canonical, &message.metadata.auth_signature)
        .context("author signature does not verify")
}

/// Seal serialized message bytes for one connection: encrypt under the
/// session and wrap in a freshly stamped envelope.
pub fn prepare_message(session: &NetworkSession, data: &[u8]) -> Result<Vec<u8>> {
    let encrypted = session.encrypt(data)?;
    let wrapped = CommonMessageData {
        timestamp: timesync::now_millis(),
        payload: encrypted,
    };
    bincode::serialize(&wrapped).context("failed to serialize message envelope")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed(keys: &KeyPair, gossip: bool) -> ProtocolMessage {
        let mut message = ProtocolMessage {
            metadata: new_protocol_message_metadata(keys.public(), "test/1", gossip),
            payload: b"payload bytes".to_vec(),
        };
        sign_message(keys, &mut message).unwrap();
        message
    }

    #[test]
    fn sign_then_verify() {
        let keys = KeyPair::generate();
        let message = signed(&keys, false);
        assert!(auth_author(&message).is_ok());
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let keys = KeyPair::generate();
        let mut message = signed(&keys, false);
        message.payload.push(0);
        assert!(auth_author(&message).is_err());
    }

    #[test]
    fn tampered_metadata_fails_verification() {
        let keys = KeyPair::generate();
        let mut message = signed(&keys, true);
        message.metadata.gossip = false;
        assert!(auth_author(&message).is_err());
    }

    #[test]
    fn claimed_author_must_match_signer() {
        let keys = KeyPair::generate();
        let other = KeyPair::generate();
        let mut message = signed(&keys, false);
        message.metadata.author_pub_key = other.public().to_vec();
        assert!(auth_author(&message).is_err());
    }

    #[test]
    fn prepare_message_roundtrip() {
        let keys = KeyPair::generate();
        let session = NetworkSession::new(
            [9u8; 16],
            [4u8; 32],
            [5u8; 32],
            vec![],
            "l".into(),
            "r".into(),
        );
        let message = signed(&keys, false);
        let data = bincode::serialize(&message).unwrap();

        let sealed = prepare_message(&session, &data).unwrap();
        let envelope: CommonMessageData = bincode::deserialize(&sealed).unwrap();
        assert!(envelope.timestamp > 0);
        let opened = session.decrypt(&envelope.payload).unwrap();
        assert_eq!(opened, data);
    }
}
