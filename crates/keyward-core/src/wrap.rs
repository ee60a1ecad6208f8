//! Wrapped key envelopes.
//!
//! Every persisted key (principal keys, grant halves, membership copies of a
//! group key) is stored as a [`WrappedKey`]. There are two variants:
//!
//! - `Sealed`: ChaCha20-Poly1305 under the owning principal's symmetric key.
//! - `Escrow`: X25519 agreement with the admin escrow public key. Anyone can
//!   write it; only a holder of the admin group key can open it.
//!
//! The same principal key opens both variants, so callers never need to know
//! which one they hold.

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto::{EncryptionNonce, EscrowPublicKey, EscrowSender, SymmetricKey};
use crate::error::{Result, SecurityError};

/// An encrypted key envelope, serialized as CBOR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WrappedKey {
    /// Wrapped under a principal's symmetric key.
    Sealed {
        nonce: EncryptionNonce,
        ciphertext: Vec<u8>,
    },

    /// Wrapped to the admin escrow public key.
    Escrow {
        ephemeral_public: EscrowPublicKey,
        nonce: EncryptionNonce,
        ciphertext: Vec<u8>,
    },
}

impl WrappedKey {
    /// Wrap raw key material under a symmetric key.
    pub fn seal(material: &[u8], key: &SymmetricKey) -> Result<Self> {
        let nonce = EncryptionNonce::generate();
        let ciphertext = key.encrypt(material, &nonce)?;
        Ok(WrappedKey::Sealed { nonce, ciphertext })
    }

    /// Wrap raw key material to the admin escrow public key.
    pub fn escrow(material: &[u8], recipient: &EscrowPublicKey) -> Result<Self> {
        let sender = EscrowSender::generate();
        let ephemeral_public = sender.public_key();
        let wrap_key = sender.wrap_key(recipient);

        let nonce = EncryptionNonce::generate();
        let ciphertext = wrap_key.encrypt(material, &nonce)?;
        Ok(WrappedKey::Escrow {
            ephemeral_public,
            nonce,
            ciphertext,
        })
    }

    /// Recover the raw key material.
    ///
    /// For `Escrow` envelopes `key` must be the admin group's key.
    pub fn open(&self, key: &SymmetricKey) -> Result<Zeroizing<Vec<u8>>> {
        let material = match self {
            WrappedKey::Sealed { nonce, ciphertext } => key.decrypt(ciphertext, nonce)?,
            WrappedKey::Escrow {
                ephemeral_public,
                nonce,
                ciphertext,
            } => {
                let wrap_key = key.escrow_secret().unwrap_key(ephemeral_public);
                wrap_key.decrypt(ciphertext, nonce)?
            }
        };
        Ok(Zeroizing::new(material))
    }

    /// Whether this envelope was written to the admin escrow key.
    pub fn is_escrow(&self) -> bool {
        matches!(self, WrappedKey::Escrow { .. })
    }

    /// Serialize to CBOR bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| SecurityError::Encryption(format!("wrapped key encoding: {}", e)))?;
        Ok(buf)
    }

    /// Deserialize from CBOR bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ciborium::from_reader(bytes)
            .map_err(|e| SecurityError::InvalidKeyMaterial(format!("wrapped key decoding: {}", e)))
    }
}

/// Wrap one principal's symmetric key under another.
pub fn wrap_principal_key(target: &SymmetricKey, under: &SymmetricKey) -> Result<WrappedKey> {
    WrappedKey::seal(target.as_bytes(), under)
}

/// Escrow a principal's symmetric key to the admin group.
pub fn escrow_principal_key(
    target: &SymmetricKey,
    admin: &EscrowPublicKey,
) -> Result<WrappedKey> {
    WrappedKey::escrow(target.as_bytes(), admin)
}

/// Recover a principal's symmetric key.
///
/// Short legacy material is left-padded back to full width.
pub fn unwrap_principal_key(wrapped: &WrappedKey, under: &SymmetricKey) -> Result<SymmetricKey> {
    let material = wrapped.open(under)?;
    SymmetricKey::from_legacy_bytes(&material)
}
