//! # keyward perms
//!
//! Principal keys, access grants, access resolution and the
//! restricted-access quorum workflow.
//!
//! ## Overview
//!
//! Access is enforced by encryption. A secret's read-key and modify-key are
//! wrapped per principal into grants; opening a secret means walking the
//! chain:
//!
//! 1. **Principal key**: unwrap the user's key with their login secret
//!    (or through admin recovery), then any group key via membership
//! 2. **Grant**: unwrap the secret's key halves with that principal key
//! 3. **Open**: decrypt the sealed payload with the read-key
//!
//! ## Key Types
//!
//! - [`KeySession`]: unwrapped keys for one unit of work, passed explicitly
//! - [`Principals`]: users, groups, memberships, admin recovery, rotation
//! - [`Grants`]: writes and removes grants; the admin grant is protected
//! - [`Resolver`]: picks the effective grant under a [`Precedence`]
//! - [`Quorum`]: restricted-access requests, votes and expiry
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use keyward_perms::{DerivedKeyVerifier, Principals};
//! use keyward_store::MemoryStore;
//!
//! async fn example() -> keyward_perms::Result<()> {
//!     let store = Arc::new(MemoryStore::new());
//!     let principals = Principals::new(store, Arc::new(DerivedKeyVerifier), 3);
//!     let admin = principals.bootstrap("root", b"secret", 0).await?;
//!     println!("admin: {}", admin.user_id());
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod grants;
pub mod principal;
pub mod quorum;
pub mod resolver;
pub mod session;

pub use error::{PermsError, Result};
pub use grants::{build_grant, open_grant, GrantLevel, GrantWrapping, Grants, SecretKeys};
pub use principal::{DerivedKeyVerifier, LoginVerifier, Principals, ADMIN_GROUP_NAME};
pub use quorum::{evaluate, Quorum, RequestStatus, Vote};
pub use resolver::{GroupVisibility, Precedence, ResolvedAccess, Resolver, UnknownPrecedence};
pub use session::KeySession;
