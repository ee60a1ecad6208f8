//! # keyward testkit
//!
//! Testing utilities for keyward.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: a bootstrapped in-memory vault on a manual clock
//! - **Generators**: proptest strategies for keys, ids, policies and votes
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use keyward_testkit::VaultFixture;
//!
//! async fn example() {
//!     let mut fixture = VaultFixture::new().await;
//!     let (alice, mut session) = fixture.user("alice").await;
//!     let secret = fixture.secret("api token", b"t0ken").await;
//!     assert!(fixture.vault.open_secret(&mut session, &secret).await.is_err());
//!     # let _ = alice;
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{login_secret, unique_name, VaultFixture, ADMIN_NAME, START_TIME};
