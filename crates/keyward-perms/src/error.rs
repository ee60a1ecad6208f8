//! Error types for the permissions module.

use thiserror::Error;

use keyward_core::{SecurityError, ValidationError};
use keyward_store::StoreError;

/// Errors that can occur during permission operations.
#[derive(Debug, Error)]
pub enum PermsError {
    /// A cryptographic or key-possession fault.
    #[error(transparent)]
    Security(#[from] SecurityError),

    /// A typed rejection (quorum unmet, expired, duplicate, ...).
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Backing store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl PermsError {
    /// Whether this is a typed rejection rather than a fault.
    pub fn is_validation(&self) -> bool {
        matches!(self, PermsError::Validation(_))
    }
}

/// Result type for permission operations.
pub type Result<T> = std::result::Result<T, PermsError>;
