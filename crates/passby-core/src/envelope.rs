//! Crypto envelope codec
//!
//! Confidentiality and integrity for message bodies, independent of the
//! transport. Bodies are sealed with ChaCha20-Poly1305 under a per-session
//! key and a fresh random nonce on every call; the relay only ever sees the
//! resulting envelope. Opening never returns unauthenticated bytes.

use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    ChaCha20Poly1305, Key, Nonce,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::errors::{PassbyError, Result};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Envelope nonce length (ChaCha20-Poly1305)
pub const NONCE_LEN: usize = 12;

/// Maximum plaintext accepted by `seal`
pub const MAX_PLAINTEXT_LEN: usize = 64 * 1024;

/// Domain separation tag for session-key derivation
const SESSION_KEY_DOMAIN: &[u8] = b"passby-session-v1";

// ----------------------------------------------------------------------------
// Session Key
// ----------------------------------------------------------------------------

/// Symmetric key bound to one (local identity, peer identity) pair.
///
/// Never serialized and never sent to the relay. Its lifetime is bounded by
/// the shorter-lived of the two identities it connects.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    /// Wrap raw key material agreed out of band
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generate a random key
    pub fn generate() -> Result<Self> {
        use rand_core::RngCore;
        let mut bytes = [0u8; 32];
        rand_core::OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|_| PassbyError::EntropyExhausted)?;
        Ok(Self(bytes))
    }

    /// Derive a key from an X25519 exchange bound to the proximity handshake.
    ///
    /// Both sides arrive at the same key once they have swapped public keys;
    /// the shared secret is hashed under a protocol domain tag so the raw DH
    /// output never doubles as key material elsewhere.
    pub fn derive(local_secret: &StaticSecret, peer_public: &PublicKey) -> Self {
        let shared = local_secret.diffie_hellman(peer_public);

        let mut hasher = Sha256::new();
        hasher.update(SESSION_KEY_DOMAIN);
        hasher.update(shared.as_bytes());
        let digest = hasher.finalize();

        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Get the raw key bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl core::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        // Key material stays out of logs
        f.write_str("SessionKey(..)")
    }
}

// ----------------------------------------------------------------------------
// Envelope
// ----------------------------------------------------------------------------

/// Authenticated-encrypted container for a message body, opaque to the relay.
/// The Poly1305 tag is appended to `ciphertext`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    /// Total envelope size in bytes
    pub fn len(&self) -> usize {
        NONCE_LEN + self.ciphertext.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ciphertext.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Seal / Open
// ----------------------------------------------------------------------------

/// Seal a plaintext under `key` with a fresh random nonce.
pub fn seal(plaintext: &[u8], key: &SessionKey) -> Result<Envelope> {
    if plaintext.len() > MAX_PLAINTEXT_LEN {
        return Err(PassbyError::PayloadTooLarge {
            size: plaintext.len(),
            max: MAX_PLAINTEXT_LEN,
        });
    }

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| PassbyError::Encryption)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes.copy_from_slice(&nonce);

    Ok(Envelope {
        nonce: nonce_bytes,
        ciphertext,
    })
}

/// Open an envelope, verifying its tag.
///
/// Fails with [`PassbyError::Authentication`] on a tampered envelope or a
/// wrong key; garbage plaintext is never returned.
pub fn open(envelope: &Envelope, key: &SessionKey) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(
            Nonce::from_slice(&envelope.nonce),
            envelope.ciphertext.as_ref(),
        )
        .map_err(|_| PassbyError::Authentication)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
