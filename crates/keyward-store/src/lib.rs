//! # keyward store
//!
//! Storage abstraction for keyward. Provides a trait-based interface for
//! principals, grants, secrets, restricted-access requests and the audit
//! log, with SQLite and in-memory implementations.
//!
//! ## Key Types
//!
//! - [`Store`] - The async trait for all storage operations
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests
//! - [`Mutation`] - One write inside an atomic batch
//!
//! ## Usage
//!
//! ```rust,no_run
//! use keyward_store::{SqliteStore, Store};
//!
//! async fn example() -> keyward_store::Result<()> {
//!     let store = SqliteStore::open("vault.db")?;
//!     let meta = store.get_meta().await?;
//!     println!("bootstrapped: {}", meta.is_some());
//!     Ok(())
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Atomic batches**: every write goes through [`Store::apply`]; a failed
//!   mutation rolls back the whole batch
//! - **Conditional votes**: [`Store::cast_vote`] is a single update keyed on
//!   (list, user), never a read followed by a write
//! - **Protected admin grant**: bulk grant deletion never touches the admin
//!   group's grant

pub mod error;
pub mod memory;
pub mod migration;
pub mod records;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use records::{
    ApproverEntry, ApproverRole, ApproverState, AuditFilter, AuditRecord, GrantRecord,
    GroupRecord, MembershipRecord, Mutation, PrincipalStatus, RaRequestRecord,
    RestrictedAccessPolicy, SecretRecord, UserRecord, VaultMeta,
};
pub use sqlite::SqliteStore;
pub use traits::{Store, StoreExt};
