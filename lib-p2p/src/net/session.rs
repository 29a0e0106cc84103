//! Authenticated symmetric session between two peers.
//!
//! A session is created by the handshake and destroyed with its owning
//! connection. It carries the encryption key, the MAC key, and the session
//! id, which doubles as the CBC initialization vector: the cipher mode is
//! rebuilt from `(key_e, id)` for every call, so the IV is pinned to the
//! session id across messages and encrypt/decrypt stay deterministically
//! paired no matter how many operations preceded them.

use std::fmt;
use std::time::SystemTime;
use thiserror::Error;

#[cfg(feature = "session-encryption")]
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};

#[cfg(feature = "session-encryption")]
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
#[cfg(feature = "session-encryption")]
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Session id length. Doubles as the AES block size so the id can serve as
/// the IV.
pub const SESSION_ID_LENGTH: usize = 16;

/// Symmetric key length (AES-256).
pub const SESSION_KEY_LENGTH: usize = 32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Empty input buffer.
    #[error("invalid input buffer - 0 len")]
    InvalidInput,

    /// Ciphertext is not a whole number of blocks or carries bad padding.
    #[error("ciphertext is malformed or padding is invalid")]
    InvalidCiphertext,
}

/// Symmetric context shared by exactly two peers, one per live connection.
pub struct NetworkSession {
    id: [u8; SESSION_ID_LENGTH],
    key_e: [u8; SESSION_KEY_LENGTH],
    key_m: [u8; SESSION_KEY_LENGTH],
    pub_key: Vec<u8>,
    created: SystemTime,
    local_node_id: String,
    remote_node_id: String,
}

impl NetworkSession {
    /// Assemble a session from handshake-derived material. `pub_key` is the
    /// ephemeral session public key both sides observed.
    pub fn new(
        id: [u8; SESSION_ID_LENGTH],
        key_e: [u8; SESSION_KEY_LENGTH],
        key_m: [u8; SESSION_KEY_LENGTH],
        pub_key: Vec<u8>,
        local_node_id: String,
        remote_node_id: String,
    ) -> Self {
        Self {
            id,
            key_e,
            key_m,
            pub_key,
            created: SystemTime::now(),
            local_node_id,
            remote_node_id,
        }
    }

    /// Unique session id, stable for the session's life.
    pub fn id(&self) -> &[u8; SESSION_ID_LENGTH] {
        &self.id
    }

    /// Shared MAC key.
    pub fn key_m(&self) -> &[u8; SESSION_KEY_LENGTH] {
        &self.key_m
    }

    /// Ephemeral session public key bytes.
    pub fn pub_key(&self) -> &[u8] {
        &self.pub_key
    }

    pub fn created(&self) -> SystemTime {
        self.created
    }

    pub fn local_node_id(&self) -> &str {
        &self.local_node_id
    }

    pub fn remote_node_id(&self) -> &str {
        &self.remote_node_id
    }

    /// Encrypt with the session key: AES-256-CBC, PKCS#7 padding, IV = id.
    #[cfg(feature = "session-encryption")]
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        if plaintext.is_empty() {
            return Err(SessionError::InvalidInput);
        }
        let ciphertext = Aes256CbcEnc::new(&self.key_e.into(), &self.id.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);
        Ok(ciphertext)
    }

    /// Decrypt data produced by the peer's `encrypt`, validating and
    /// stripping the padding.
    #[cfg(feature = "session-encryption")]
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, SessionError> {
        if ciphertext.is_empty() {
            return Err(SessionError::InvalidInput);
        }
        Aes256CbcDec::new(&self.key_e.into(), &self.id.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| SessionError::InvalidCiphertext)
    }

    #[cfg(not(feature = "session-encryption"))]
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        if plaintext.is_empty() {
            return Err(SessionError::InvalidInput);
        }
        Ok(plaintext.to_vec())
    }

    #[cfg(not(feature = "session-encryption"))]
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, SessionError> {
        if ciphertext.is_empty() {
            return Err(SessionError::InvalidInput);
        }
        Ok(ciphertext.to_vec())
    }
}

// Keys stay out of debug output.
impl fmt::Debug for NetworkSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NetworkSession({} {} -> {})",
            hex::encode(self.id),
            self.local_node_id,
            self.remote_node_id
        )
    }
}
