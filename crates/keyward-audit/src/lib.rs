//! # keyward audit
//!
//! Tamperproof, append-only audit log.
//!
//! Each entry records a time, an optional secret, the acting user (or the
//! no-user sentinel), an event description and an optional stamp. The
//! stamp binds the entry to the acting user's key material; validating it
//! with any other key, or after editing a stored field, fails.
//!
//! ## Key Types
//!
//! - [`AuditLog`] - Appends, fetches and validates entries
//! - [`Actor`] - Who caused an event, and whether their key is at hand
//! - [`AuditVerdict`] - `Valid`, `Invalid` or `Unknown`
//! - [`Notifier`] - Best-effort forwarding; failures become degraded entries

pub mod error;
pub mod log;
pub mod notifier;
pub mod stamp;

pub use error::{AuditError, NotificationError, Result};
pub use log::{Actor, AuditLog};
pub use notifier::{ChannelNotifier, Notifier};
pub use stamp::{entry_hash, record_hash, user_stamp, verify, AuditVerdict};
