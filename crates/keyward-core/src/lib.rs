//! # keyward core
//!
//! Pure primitives for the keyward vault: identifiers, symmetric key
//! wrapping, admin escrow and the two-tier secret cipher.
//!
//! This crate performs no I/O. Everything here is computation over key
//! material.
//!
//! ## Key Types
//!
//! - [`SymmetricKey`] - A principal's key, or a one-off session key
//! - [`WrappedKey`] - An encrypted key envelope as stored in the vault
//! - [`SecretKeypair`] - A secret's [`ModifyKey`] / [`ReadKey`] pair
//! - [`Principal`] - A user or a group
//!
//! ## Compatibility
//!
//! Short key material from older records is zero-padded back to canonical
//! width. See the [`compat`] module.

pub mod cipher;
pub mod compat;
pub mod crypto;
pub mod error;
pub mod types;
pub mod wrap;

pub use cipher::{open, seal, ModifyKey, ReadKey, SecretKeypair};
pub use crypto::{EncryptionNonce, EscrowPublicKey, EscrowSecret, SymmetricKey};
pub use error::{Result, SecurityError, ValidationError};
pub use types::{
    AccessMode, ApproverListId, GrantKind, GroupId, Principal, RequestId, SecretId, UserId,
};
pub use wrap::{escrow_principal_key, unwrap_principal_key, wrap_principal_key, WrappedKey};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
