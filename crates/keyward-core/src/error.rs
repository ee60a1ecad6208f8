//! Error types for keyward core.

use thiserror::Error;

use crate::types::{Principal, RequestId, SecretId};

/// Security faults. These are always surfaced to the caller and never
/// downgraded to an empty or default value.
#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("illegal attempt to update a secret: no modify key")]
    MissingModifyKey,

    #[error("illegal attempt to read a secret: no read key")]
    MissingReadKey,

    #[error("no unwrapped key for {0}")]
    KeyLocked(Principal),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("sealed payload signature does not verify")]
    BadSignature,

    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("access denied to secret {secret}: {reason}")]
    AccessDenied { secret: SecretId, reason: String },
}

/// Typed rejections used for normal control flow.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("duplicate identifier: {0}")]
    Duplicate(String),

    #[error("restricted access request {0} has expired")]
    Expired(RequestId),

    #[error("restricted access request {0} has not reached its approval quorum")]
    QuorumNotMet(RequestId),

    #[error("restricted access request {0} was blocked")]
    Blocked(RequestId),

    #[error("user is not an approver on request {0}")]
    NotAnApprover(RequestId),

    #[error("secret {0} requires an approved restricted access request")]
    RestrictedAccessRequired(SecretId),

    #[error("the vault has already been bootstrapped")]
    AlreadyBootstrapped,

    #[error("the vault has not been bootstrapped")]
    NotBootstrapped,

    #[error("principal is disabled: {0}")]
    Disabled(String),

    #[error("login failed")]
    LoginFailed,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("operation not permitted on protected principal: {0}")]
    Protected(String),
}

/// Result type for core security operations.
pub type Result<T> = std::result::Result<T, SecurityError>;
