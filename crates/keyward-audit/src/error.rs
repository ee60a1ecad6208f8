//! Error types for the audit log.

use thiserror::Error;

use keyward_core::SecurityError;
use keyward_store::StoreError;

/// Errors that can occur while writing or validating the audit log.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A key needed for validation could not be unwrapped.
    #[error(transparent)]
    Security(#[from] SecurityError),

    /// No entry with this id.
    #[error("audit entry not found: {0}")]
    NotFound(u64),
}

/// A notifier could not deliver an entry.
///
/// Never escapes the audit log: it is turned into a degraded entry.
#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("notifier unavailable: {0}")]
    Unavailable(String),

    #[error("notification rejected: {0}")]
    Rejected(String),

    #[error("notification channel closed")]
    Closed,
}

/// Result type for audit operations.
pub type Result<T> = std::result::Result<T, AuditError>;
