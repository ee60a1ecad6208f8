//! # keyward
//!
//! The authorization and cryptographic core of a shared-secret vault.
//!
//! ## Overview
//!
//! keyward decides who may read or modify a stored secret, enforces that
//! decision through encryption, and records every decision in a
//! tamper-evident log:
//!
//! - **Two-tier cipher**: each secret has a keypair; the modify-key seals,
//!   the read-key opens
//! - **Principal keys**: every user and group owns a symmetric key; grants
//!   wrap a secret's keys under them
//! - **Resolver**: picks the effective grant under user-first or
//!   group-first precedence
//! - **Restricted access**: quorum approval gates reads of sensitive secrets
//! - **Audit log**: every operation is appended and stamped with the acting
//!   user's key
//!
//! ## Usage
//!
//! ```rust,no_run
//! use keyward::{Vault, VaultConfig};
//! use keyward::store::SqliteStore;
//!
//! async fn example() -> keyward::Result<()> {
//!     let store = SqliteStore::open("vault.db")?;
//!     let vault = Vault::new(store, VaultConfig::default());
//!
//!     let mut admin = vault.bootstrap("root", b"correct horse").await?;
//!     let secret = vault
//!         .create_secret(&mut admin, "db password", b"hunter2", None)
//!         .await?;
//!     let payload = vault.open_secret(&mut admin, &secret).await?;
//!     assert_eq!(payload, b"hunter2");
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `keyward::core` - ids, keys, seal/open, key wrapping
//! - `keyward::store` - storage abstraction, SQLite and in-memory stores
//! - `keyward::perms` - principal keys, grants, resolver, quorum
//! - `keyward::audit` - the audit log

pub mod clock;
pub mod config;
pub mod error;
pub mod vault;

pub use keyward_audit as audit;
pub use keyward_core as core;
pub use keyward_perms as perms;
pub use keyward_store as store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, ConfigLookup, MapConfig, VaultConfig};
pub use error::{Result, VaultError};
pub use vault::{Vault, VaultBuilder};

pub use keyward_audit::{AuditVerdict, ChannelNotifier, Notifier};
pub use keyward_core::{
    open, seal, unwrap_principal_key, wrap_principal_key, AccessMode, GroupId, Principal,
    RequestId, SecretId, SecurityError, UserId, ValidationError,
};
pub use keyward_perms::{
    GrantLevel, GroupVisibility, KeySession, Precedence, RequestStatus, ResolvedAccess, Vote,
};
pub use keyward_store::{PrincipalStatus, RestrictedAccessPolicy};
