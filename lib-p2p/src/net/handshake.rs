//! Two-frame session handshake.
//!
//! The initiator generates an ephemeral X25519 key and runs ECDH against the
//! Montgomery form of the responder's identity key, so only the holder of
//! that identity can derive the same shared secret. HKDF-SHA256 expands the
//! secret into the session id (also the cipher IV), the encryption key and
//! the MAC key. The request is signed by the initiator's identity; the
//! response is signed by the responder's identity and carries a keyed-hash
//! confirmation over the session id, proving the responder derived the same
//! session.

use crate::identity::{KeyPair, PublicKey};
use crate::net::session::{NetworkSession, SESSION_ID_LENGTH, SESSION_KEY_LENGTH};
use curve25519_dalek::edwards::CompressedEdwardsY;
use curve25519_dalek::montgomery::MontgomeryPoint;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

/// Domain separator for session key expansion.
const SESSION_INFO: &[u8] = b"p2p session keys v1";

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("network id mismatch: ours {ours}, theirs {theirs}")]
    NetworkMismatch { ours: i8, theirs: i8 },

    #[error("peer identity does not match the expected public key")]
    WrongPeer,

    #[error("invalid identity key: {0}")]
    InvalidKey(String),

    #[error("handshake signature verification failed")]
    InvalidSignature,

    #[error("session confirmation mac mismatch")]
    MacMismatch,

    #[error("degenerate shared secret")]
    DegenerateSecret,

    #[error("handshake serialization failed: {0}")]
    Serialization(String),
}

/// First frame on a new connection, initiator to responder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Initiator's identity public key.
    pub node_pub_key: Vec<u8>,
    pub network_id: i8,
    /// Port the initiator listens on, for the responder's routing table.
    pub port: u16,
    /// Ephemeral X25519 public key the session is derived from.
    pub session_pub_key: [u8; 32],
    /// Identity signature over this request with the field zeroed.
    pub signature: Vec<u8>,
}

/// Second frame, responder to initiator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Responder's identity public key.
    pub node_pub_key: Vec<u8>,
    pub network_id: i8,
    pub port: u16,
    /// Keyed hash of the session id under the session MAC key.
    pub mac: [u8; 32],
    /// Identity signature over this response with the field zeroed.
    pub signature: Vec<u8>,
}

impl HandshakeRequest {
    fn canonical_bytes(&self) -> Result<Vec<u8>, HandshakeError> {
        let mut unsigned = self.clone();
        unsigned.signature.clear();
        bincode::serialize(&unsigned).map_err(|e| HandshakeError::Serialization(e.to_string()))
    }
}

impl HandshakeResponse {
    fn canonical_bytes(&self) -> Result<Vec<u8>, HandshakeError> {
        let mut unsigned = self.clone();
        unsigned.signature.clear();
        bincode::serialize(&unsigned).map_err(|e| HandshakeError::Serialization(e.to_string()))
    }
}

/// Expand the ECDH secret into `(id, key_e, key_m)`. The ephemeral public
/// key and the network id are mixed in so sessions are bound to both.
fn derive_session_material(
    shared: &[u8; 32],
    session_pub_key: &[u8; 32],
    network_id: i8,
) -> (
    [u8; SESSION_ID_LENGTH],
    [u8; SESSION_KEY_LENGTH],
    [u8; SESSION_KEY_LENGTH],
) {
    let hk = Hkdf::<Sha256>::new(Some(session_pub_key), shared);
    let mut info = Vec::with_capacity(SESSION_INFO.len() + 1);
    info.extend_from_slice(SESSION_INFO);
    info.push(network_id as u8);

    let mut okm = [0u8; SESSION_ID_LENGTH + 2 * SESSION_KEY_LENGTH];
    // output length is fixed and far below the hkdf limit
    hk.expand(&info, &mut okm)
        .expect("hkdf output length is valid");

    let mut id = [0u8; SESSION_ID_LENGTH];
    let mut key_e = [0u8; SESSION_KEY_LENGTH];
    let mut key_m = [0u8; SESSION_KEY_LENGTH];
    id.copy_from_slice(&okm[..SESSION_ID_LENGTH]);
    key_e.copy_from_slice(&okm[SESSION_ID_LENGTH..SESSION_ID_LENGTH + SESSION_KEY_LENGTH]);
    key_m.copy_from_slice(&okm[SESSION_ID_LENGTH + SESSION_KEY_LENGTH..]);
    (id, key_e, key_m)
}

fn confirmation_mac(session: &NetworkSession) -> [u8; 32] {
    *blake3::keyed_hash(session.key_m(), session.id()).as_bytes()
}

/// Initiator side: build the request frame and the session it implies.
pub fn generate_handshake_request(
    local_keys: &KeyPair,
    remote_pub: &PublicKey,
    network_id: i8,
    port: u16,
) -> Result<(HandshakeRequest, NetworkSession), HandshakeError> {
    let ephemeral = x25519_dalek::EphemeralSecret::random_from_rng(OsRng);
    let session_pub_key = x25519_dalek::PublicKey::from(&ephemeral).to_bytes();

    // map the remote identity key onto the birationally equivalent
    // Montgomery curve so the ephemeral X25519 key can run ECDH against it
    let remote_mont = CompressedEdwardsY(*remote_pub.bytes())
        .decompress()
        .ok_or_else(|| {
            HandshakeError::InvalidKey("public key is not a valid curve point".to_string())
        })?
        .to_montgomery();
    let shared = ephemeral.diffie_hellman(&x25519_dalek::PublicKey::from(remote_mont.to_bytes()));
    if !shared.was_contributory() {
        return Err(HandshakeError::DegenerateSecret);
    }

    let (id, key_e, key_m) = derive_session_material(shared.as_bytes(), &session_pub_key, network_id);
    let session = NetworkSession::new(
        id,
        key_e,
        key_m,
        session_pub_key.to_vec(),
        local_keys.public().to_string_key(),
        remote_pub.to_string_key(),
    );

    let mut request = HandshakeRequest {
        node_pub_key: local_keys.public().to_vec(),
        network_id,
        port,
        session_pub_key,
        signature: Vec::new(),
    };
    request.signature = local_keys.sign(&request.canonical_bytes()?);

    Ok((request, session))
}

/// Responder side: validate the request, derive the matching session, and
/// build the signed response frame.
pub fn process_handshake_request(
    network_id: i8,
    local_keys: &KeyPair,
    local_port: u16,
    remote_pub: &PublicKey,
    request: &HandshakeRequest,
) -> Result<(HandshakeResponse, NetworkSession), HandshakeError> {
    if request.network_id != network_id {
        return Err(HandshakeError::NetworkMismatch {
            ours: network_id,
            theirs: request.network_id,
        });
    }
    if request.node_pub_key != remote_pub.to_vec() {
        return Err(HandshakeError::WrongPeer);
    }
    remote_pub
        .verify(&request.canonical_bytes()?, &request.signature)
        .map_err(|_| HandshakeError::InvalidSignature)?;

    // scalar-multiply the initiator's ephemeral point with the identity
    // scalar directly; the scalar must not be re-clamped here or the two
    // sides diverge
    let shared = (local_keys.dh_scalar() * MontgomeryPoint(request.session_pub_key)).to_bytes();
    if shared == [0u8; 32] {
        return Err(HandshakeError::DegenerateSecret);
    }

    let (id, key_e, key_m) = derive_session_material(&shared, &request.session_pub_key, network_id);
    let session = NetworkSession::new(
        id,
        key_e,
        key_m,
        request.session_pub_key.to_vec(),
        local_keys.public().to_string_key(),
        remote_pub.to_string_key(),
    );

    let mut response = HandshakeResponse {
        node_pub_key: local_keys.public().to_vec(),
        network_id,
        port: local_port,
        mac: confirmation_mac(&session),
        signature: Vec::new(),
    };
    response.signature = local_keys.sign(&response.canonical_bytes()?);

    Ok((response, session))
}

/// Initiator side: validate the response frame against the session derived
/// at request time.
pub fn process_handshake_response(
    remote_pub: &PublicKey,
    session: &NetworkSession,
    response: &HandshakeResponse,
) -> Result<(), HandshakeError> {
    if response.node_pub_key != remote_pub.to_vec() {
        return Err(HandshakeError::WrongPeer);
    }
    remote_pub
        .verify(&response.canonical_bytes()?, &response.signature)
        .map_err(|_| HandshakeError::InvalidSignature)?;

    // constant-time comparison via blake3::Hash
    if blake3::Hash::from(response.mac) != blake3::keyed_hash(session.key_m(), session.id()) {
        return Err(HandshakeError::MacMismatch);
    }
    Ok(())
}
