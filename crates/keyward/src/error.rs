//! Error types for the vault.

use thiserror::Error;

use keyward_audit::AuditError;
use keyward_core::{SecurityError, ValidationError};
use keyward_perms::PermsError;
use keyward_store::StoreError;

use crate::config::ConfigError;

/// Errors that can occur during vault operations.
#[derive(Debug, Error)]
pub enum VaultError {
    /// A cryptographic or key-possession fault.
    #[error("security error: {0}")]
    Security(#[from] SecurityError),

    /// A typed rejection; normal control flow.
    #[error("rejected: {0}")]
    Validation(#[from] ValidationError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Audit log error.
    #[error("audit error: {0}")]
    Audit(#[from] AuditError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<PermsError> for VaultError {
    fn from(e: PermsError) -> Self {
        match e {
            PermsError::Security(e) => VaultError::Security(e),
            PermsError::Validation(e) => VaultError::Validation(e),
            PermsError::Store(e) => VaultError::Store(e),
        }
    }
}

impl VaultError {
    /// Whether this is a typed rejection rather than a fault.
    pub fn is_validation(&self) -> bool {
        matches!(self, VaultError::Validation(_))
    }

    /// Whether this is a security fault.
    pub fn is_security(&self) -> bool {
        matches!(self, VaultError::Security(_))
    }

    /// Security and validation failures are audited; faults are not.
    pub(crate) fn is_auditable(&self) -> bool {
        self.is_validation() || self.is_security()
    }
}

/// Result type for vault operations.
pub type Result<T> = std::result::Result<T, VaultError>;
