//! Node identity keys.
//!
//! A peer is identified by the 32-byte encoding of its Ed25519 public key.
//! The same keypair signs protocol messages and anchors the handshake: the
//! session key derivation runs X25519 against the Montgomery form of the
//! remote identity key, so proving knowledge of the session also proves
//! ownership of the identity.

use anyhow::{anyhow, Result};
use ed25519_dalek::{Signer, Verifier};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of the canonical public key encoding.
pub const PUBLIC_KEY_LENGTH: usize = 32;

/// Length of an identity signature.
pub const SIGNATURE_LENGTH: usize = 64;

/// A peer's stable identifier: an Ed25519 public key.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey {
    bytes: [u8; PUBLIC_KEY_LENGTH],
}

impl PublicKey {
    /// Build a public key from its canonical byte encoding. Fails when the
    /// bytes do not decode to a valid curve point.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; PUBLIC_KEY_LENGTH] = bytes
            .try_into()
            .map_err(|_| anyhow!("public key must be {} bytes, got {}", PUBLIC_KEY_LENGTH, bytes.len()))?;
        // reject encodings that are not valid points up front
        ed25519_dalek::VerifyingKey::from_bytes(&bytes)
            .map_err(|e| anyhow!("invalid public key encoding: {}", e))?;
        Ok(Self { bytes })
    }

    /// Canonical byte encoding.
    pub fn bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.bytes
    }

    /// Canonical byte encoding as an owned vector.
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.to_vec()
    }

    /// Full printable form, used as the map key in the connection pool and
    /// the routing table.
    pub fn to_string_key(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Short printable form for logs.
    pub fn pretty(&self) -> String {
        hex::encode(&self.bytes[..4])
    }

    /// Verify `signature` over `message` against this key.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        let key = ed25519_dalek::VerifyingKey::from_bytes(&self.bytes)
            .map_err(|e| anyhow!("invalid public key encoding: {}", e))?;
        let signature = ed25519_dalek::Signature::from_slice(signature)
            .map_err(|e| anyhow!("malformed signature: {}", e))?;
        key.verify(message, &signature)
            .map_err(|_| anyhow!("signature verification failed"))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.pretty())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

/// A local identity: signing key plus its public half.
pub struct KeyPair {
    public: PublicKey,
    secret: ed25519_dalek::SigningKey,
}

impl KeyPair {
    /// Generate a fresh identity from the system RNG.
    pub fn generate() -> Self {
        let secret = ed25519_dalek::SigningKey::generate(&mut OsRng);
        let public = PublicKey {
            bytes: secret.verifying_key().to_bytes(),
        };
        Self { public, secret }
    }

    /// Rebuild a keypair from a 32-byte Ed25519 seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let secret = ed25519_dalek::SigningKey::from_bytes(seed);
        let public = PublicKey {
            bytes: secret.verifying_key().to_bytes(),
        };
        Self { public, secret }
    }

    /// The public half.
    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// Sign `message` with the identity key.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.secret.sign(message).to_bytes().to_vec()
    }

    /// Diffie-Hellman scalar of the identity key, used by the responder side
    /// of the handshake to run ECDH against the initiator's ephemeral key.
    /// The expanded secret scalar is already clamped per RFC 8032 when it is
    /// derived from the seed.
    pub(crate) fn dh_scalar(&self) -> curve25519_dalek::scalar::Scalar {
        ed25519_dalek::hazmat::ExpandedSecretKey::from(&self.secret.to_bytes()).scalar
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never print secret material
        write!(f, "KeyPair({})", self.public.pretty())
    }
}
