//! Symmetric keys, nonces and the admin escrow key agreement.
//!
//! Provides ChaCha20-Poly1305 authenticated encryption, BLAKE3 key
//! derivation and X25519 escrow wrapping.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::compat::to_canonical_width;
use crate::error::{Result, SecurityError};

/// Length of every symmetric key in bytes.
pub const SYMMETRIC_KEY_LEN: usize = 32;

const LOGIN_WRAP_CONTEXT: &str = "keyward 2024 login wrapping key v1";
const ESCROW_SECRET_CONTEXT: &str = "keyward 2024 admin escrow secret v1";
const ESCROW_WRAP_CONTEXT: &str = "keyward 2024 admin escrow wrap v1";

/// A 256-bit symmetric key owned by a principal or used as a session key.
///
/// Key bytes are cleared on drop.
#[derive(Clone)]
pub struct SymmetricKey([u8; SYMMETRIC_KEY_LEN]);

impl SymmetricKey {
    /// Generate a new random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SYMMETRIC_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; SYMMETRIC_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Create from possibly-short legacy bytes, zero-padding on the left.
    pub fn from_legacy_bytes(bytes: &[u8]) -> Result<Self> {
        to_canonical_width::<SYMMETRIC_KEY_LEN>(bytes).map(Self)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; SYMMETRIC_KEY_LEN] {
        &self.0
    }

    /// Derive the key that wraps a user's key from their login secret.
    pub fn from_login_secret(salt: &[u8], login_secret: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new_derive_key(LOGIN_WRAP_CONTEXT);
        hasher.update(salt);
        hasher.update(login_secret);
        Self(*hasher.finalize().as_bytes())
    }

    /// Derive a subkey for a separate purpose.
    pub fn derive(&self, context: &str) -> SymmetricKey {
        let mut hasher = blake3::Hasher::new_derive_key(context);
        hasher.update(&self.0);
        SymmetricKey(*hasher.finalize().as_bytes())
    }

    /// Keyed BLAKE3 over `data`. Deterministic for a given key.
    pub fn keyed_hash(&self, data: &[u8]) -> blake3::Hash {
        blake3::keyed_hash(&self.0, data)
    }

    /// Encrypt data with this key.
    pub fn encrypt(&self, plaintext: &[u8], nonce: &EncryptionNonce) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| SecurityError::Encryption(e.to_string()))?;

        cipher
            .encrypt(Nonce::from_slice(&nonce.0), plaintext)
            .map_err(|e| SecurityError::Encryption(e.to_string()))
    }

    /// Decrypt data with this key.
    pub fn decrypt(&self, ciphertext: &[u8], nonce: &EncryptionNonce) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| SecurityError::Decryption(e.to_string()))?;

        cipher
            .decrypt(Nonce::from_slice(&nonce.0), ciphertext)
            .map_err(|e| SecurityError::Decryption(e.to_string()))
    }

    /// The X25519 escrow secret this key controls.
    ///
    /// Only meaningful for the root admin group's key.
    pub fn escrow_secret(&self) -> EscrowSecret {
        let seed = self.derive(ESCROW_SECRET_CONTEXT);
        EscrowSecret(StaticSecret::from(*seed.as_bytes()))
    }
}

impl PartialEq for SymmetricKey {
    fn eq(&self, other: &Self) -> bool {
        // blake3::Hash comparison is constant time
        blake3::hash(&self.0) == blake3::hash(&other.0)
    }
}

impl Eq for SymmetricKey {}

impl Drop for SymmetricKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// A 96-bit nonce for ChaCha20-Poly1305.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionNonce(pub [u8; 12]);

impl EncryptionNonce {
    /// Generate a new random nonce.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

/// Public half of the admin escrow key (X25519).
///
/// Anyone may wrap key material to it; only a holder of the admin group's
/// symmetric key can unwrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowPublicKey(pub [u8; 32]);

impl EscrowPublicKey {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn to_dalek(self) -> PublicKey {
        PublicKey::from(self.0)
    }
}

/// Secret half of the admin escrow key.
pub struct EscrowSecret(StaticSecret);

impl EscrowSecret {
    /// Derive the public key.
    pub fn public_key(&self) -> EscrowPublicKey {
        EscrowPublicKey(*PublicKey::from(&self.0).as_bytes())
    }

    /// Recover the wrapping key for an escrow entry.
    pub(crate) fn unwrap_key(&self, ephemeral_public: &EscrowPublicKey) -> SymmetricKey {
        let shared = self.0.diffie_hellman(&ephemeral_public.to_dalek());
        escrow_wrap_key(shared.as_bytes(), ephemeral_public)
    }
}

/// One-time sender side of an escrow wrap.
pub(crate) struct EscrowSender {
    secret: EphemeralSecret,
    public: EscrowPublicKey,
}

impl EscrowSender {
    pub(crate) fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(rand::thread_rng());
        let public = EscrowPublicKey(*PublicKey::from(&secret).as_bytes());
        Self { secret, public }
    }

    pub(crate) fn public_key(&self) -> EscrowPublicKey {
        self.public
    }

    /// Consume the ephemeral secret and derive the wrapping key.
    pub(crate) fn wrap_key(self, recipient: &EscrowPublicKey) -> SymmetricKey {
        let shared = self.secret.diffie_hellman(&recipient.to_dalek());
        escrow_wrap_key(shared.as_bytes(), &self.public)
    }
}

fn escrow_wrap_key(shared: &[u8; 32], ephemeral_public: &EscrowPublicKey) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(ESCROW_WRAP_CONTEXT);
    hasher.update(shared);
    hasher.update(ephemeral_public.as_bytes());
    SymmetricKey(*hasher.finalize().as_bytes())
}
