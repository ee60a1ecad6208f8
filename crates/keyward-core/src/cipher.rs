//! The two-tier secret cipher.
//!
//! Each secret owns one keypair, generated at creation and never rotated:
//!
//! - the **modify-key** holds an Ed25519 signing seed and a 32-byte share key;
//! - the **read-key** holds the matching verifying key and the same share key.
//!
//! `seal` draws a fresh session key, encrypts the payload with it, wraps the
//! session key under the share key and signs the result. `open` verifies the
//! signature, unwraps the session key and decrypts. A read-key holder can
//! therefore decrypt but cannot produce a blob that `open` accepts.
//!
//! Blob layout:
//!
//! ```text
//! signature (64) || nonce (12) || wrapped session key (48) || nonce (12) || ciphertext
//! \____________________ header (124) ___________________/
//! ```

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use std::fmt;
use zeroize::Zeroizing;

use crate::compat::to_canonical_width;
use crate::crypto::{EncryptionNonce, SymmetricKey, SYMMETRIC_KEY_LEN};
use crate::error::{Result, SecurityError};

/// Length of the encoded modify-key and read-key.
pub const KEY_HALF_LEN: usize = 64;

/// Fixed width of the sealed blob header.
pub const HEADER_LEN: usize = SIGNATURE_LEN + NONCE_LEN + WRAPPED_SESSION_LEN;

const SIGNATURE_LEN: usize = 64;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const WRAPPED_SESSION_LEN: usize = SYMMETRIC_KEY_LEN + TAG_LEN;

const SEAL_DOMAIN: &[u8] = b"keyward-seal-v1";

/// The private half of a secret's keypair. Grants the right to seal.
#[derive(Clone)]
pub struct ModifyKey {
    signing: SigningKey,
    share: SymmetricKey,
}

impl ModifyKey {
    /// The matching read-key.
    pub fn read_key(&self) -> ReadKey {
        ReadKey {
            verifying: self.signing.verifying_key(),
            share: self.share.clone(),
        }
    }

    /// Encode as `seed || share key`.
    pub fn to_bytes(&self) -> Zeroizing<[u8; KEY_HALF_LEN]> {
        let mut out = Zeroizing::new([0u8; KEY_HALF_LEN]);
        out[..32].copy_from_slice(&self.signing.to_bytes());
        out[32..].copy_from_slice(self.share.as_bytes());
        out
    }

    /// Decode, left-padding short legacy material.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let full = Zeroizing::new(to_canonical_width::<KEY_HALF_LEN>(bytes)?);
        let (seed, share) = split_halves(&full);
        Ok(Self {
            signing: SigningKey::from_bytes(&seed),
            share: SymmetricKey::from_bytes(share),
        })
    }
}

impl fmt::Debug for ModifyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ModifyKey(..)")
    }
}

/// The public half of a secret's keypair. Grants the right to open.
#[derive(Clone)]
pub struct ReadKey {
    verifying: VerifyingKey,
    share: SymmetricKey,
}

impl ReadKey {
    /// Encode as `verifying key || share key`.
    pub fn to_bytes(&self) -> Zeroizing<[u8; KEY_HALF_LEN]> {
        let mut out = Zeroizing::new([0u8; KEY_HALF_LEN]);
        out[..32].copy_from_slice(self.verifying.as_bytes());
        out[32..].copy_from_slice(self.share.as_bytes());
        out
    }

    /// Decode, left-padding short legacy material.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let full = Zeroizing::new(to_canonical_width::<KEY_HALF_LEN>(bytes)?);
        let (public, share) = split_halves(&full);
        let verifying = VerifyingKey::from_bytes(&public)
            .map_err(|e| SecurityError::InvalidKeyMaterial(format!("read key: {}", e)))?;
        Ok(Self {
            verifying,
            share: SymmetricKey::from_bytes(share),
        })
    }
}

impl PartialEq for ReadKey {
    fn eq(&self, other: &Self) -> bool {
        self.verifying == other.verifying && self.share == other.share
    }
}

impl Eq for ReadKey {}

impl fmt::Debug for ReadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReadKey({})", &hex::encode(self.verifying.as_bytes())[..12])
    }
}

/// A secret's full keypair.
#[derive(Debug, Clone)]
pub struct SecretKeypair {
    modify: ModifyKey,
}

impl SecretKeypair {
    /// Generate a fresh keypair for a new secret.
    pub fn generate() -> Self {
        let mut seed = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill_bytes(&mut seed[..]);
        Self {
            modify: ModifyKey {
                signing: SigningKey::from_bytes(&seed),
                share: SymmetricKey::generate(),
            },
        }
    }

    /// The modify (private) half.
    pub fn modify_key(&self) -> &ModifyKey {
        &self.modify
    }

    /// The read (public) half.
    pub fn read_key(&self) -> ReadKey {
        self.modify.read_key()
    }
}

/// Seal a payload. Requires the modify-key.
pub fn seal(payload: &[u8], modify_key: Option<&ModifyKey>) -> Result<Vec<u8>> {
    let modify_key = modify_key.ok_or(SecurityError::MissingModifyKey)?;

    let session = SymmetricKey::generate();
    let payload_nonce = EncryptionNonce::generate();
    let ciphertext = session.encrypt(payload, &payload_nonce)?;

    let session_nonce = EncryptionNonce::generate();
    let wrapped_session = modify_key.share.encrypt(session.as_bytes(), &session_nonce)?;
    if wrapped_session.len() != WRAPPED_SESSION_LEN {
        return Err(SecurityError::Encryption(format!(
            "wrapped session key has {} bytes",
            wrapped_session.len()
        )));
    }

    let mut blob = Vec::with_capacity(HEADER_LEN + NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&[0u8; SIGNATURE_LEN]);
    blob.extend_from_slice(session_nonce.as_bytes());
    blob.extend_from_slice(&wrapped_session);
    blob.extend_from_slice(payload_nonce.as_bytes());
    blob.extend_from_slice(&ciphertext);

    let signature = modify_key
        .signing
        .sign(&signing_message(&blob[SIGNATURE_LEN..]));
    blob[..SIGNATURE_LEN].copy_from_slice(&signature.to_bytes());

    Ok(blob)
}

/// Open a sealed payload. Requires the read-key.
pub fn open(blob: &[u8], read_key: Option<&ReadKey>) -> Result<Vec<u8>> {
    let read_key = read_key.ok_or(SecurityError::MissingReadKey)?;

    if blob.len() < HEADER_LEN + NONCE_LEN {
        return Err(SecurityError::Decryption(format!(
            "sealed blob too short: {} bytes",
            blob.len()
        )));
    }

    let (sig_bytes, signed) = blob.split_at(SIGNATURE_LEN);
    let mut sig_arr = [0u8; SIGNATURE_LEN];
    sig_arr.copy_from_slice(sig_bytes);
    read_key
        .verifying
        .verify(&signing_message(signed), &Signature::from_bytes(&sig_arr))
        .map_err(|_| SecurityError::BadSignature)?;

    let (session_nonce, rest) = signed.split_at(NONCE_LEN);
    let (wrapped_session, rest) = rest.split_at(WRAPPED_SESSION_LEN);
    let (payload_nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let session_bytes = Zeroizing::new(
        read_key
            .share
            .decrypt(wrapped_session, &nonce_from_slice(session_nonce))?,
    );
    let session = SymmetricKey::from_legacy_bytes(&session_bytes)?;

    session.decrypt(ciphertext, &nonce_from_slice(payload_nonce))
}

fn signing_message(signed: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(SEAL_DOMAIN.len() + signed.len());
    message.extend_from_slice(SEAL_DOMAIN);
    message.extend_from_slice(signed);
    message
}

fn nonce_from_slice(bytes: &[u8]) -> EncryptionNonce {
    let mut arr = [0u8; NONCE_LEN];
    arr.copy_from_slice(bytes);
    EncryptionNonce::from_bytes(arr)
}

fn split_halves(full: &[u8; KEY_HALF_LEN]) -> ([u8; 32], [u8; 32]) {
    let mut first = [0u8; 32];
    let mut second = [0u8; 32];
    first.copy_from_slice(&full[..32]);
    second.copy_from_slice(&full[32..]);
    (first, second)
}
