//! Test fixtures and helpers.
//!
//! Common setup code for integration tests: a bootstrapped in-memory vault
//! on a manual clock, plus helpers for users, groups and secrets.

use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;

use keyward::{ManualClock, Vault, VaultConfig};
use keyward_core::{GroupId, SecretId, UserId};
use keyward_perms::KeySession;
use keyward_store::{MemoryStore, RestrictedAccessPolicy};

/// Name of the bootstrapped administrator.
pub const ADMIN_NAME: &str = "root";

/// Start time of the fixture clock.
pub const START_TIME: i64 = 1_700_000_000_000;

/// The login secret fixtures give a user.
pub fn login_secret(name: &str) -> Vec<u8> {
    format!("{}-login-secret", name).into_bytes()
}

/// A random user name with a fixed prefix.
pub fn unique_name(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("{}-{}", prefix, suffix)
}

/// A bootstrapped vault over a memory store.
pub struct VaultFixture {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub vault: Vault<MemoryStore>,
    pub admin: KeySession,
}

impl VaultFixture {
    /// Bootstrap with the default configuration.
    pub async fn new() -> Self {
        Self::with_config(VaultConfig::default()).await
    }

    /// Bootstrap with a custom configuration.
    pub async fn with_config(config: VaultConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(START_TIME));
        let vault = Vault::builder(store.clone(), config)
            .clock(clock.clone())
            .build();
        let admin = vault
            .bootstrap(ADMIN_NAME, &login_secret(ADMIN_NAME))
            .await
            .expect("bootstrap");

        Self {
            store,
            clock,
            vault,
            admin,
        }
    }

    /// A second vault over the same store and clock.
    pub fn vault_with(&self, config: VaultConfig) -> Vault<MemoryStore> {
        Vault::builder(self.store.clone(), config)
            .clock(self.clock.clone())
            .build()
    }

    /// Create a user and log them in.
    pub async fn user(&mut self, name: &str) -> (UserId, KeySession) {
        let id = self
            .vault
            .create_user(&mut self.admin, name, &login_secret(name))
            .await
            .expect("create user");
        let session = self
            .vault
            .login(name, &login_secret(name))
            .await
            .expect("login");
        (id, session)
    }

    /// Create a group owned by the admin and add `members` to it.
    pub async fn group(&mut self, name: &str, members: &[UserId]) -> GroupId {
        let group_id = self
            .vault
            .create_group(&mut self.admin, name)
            .await
            .expect("create group");
        for member in members {
            self.vault
                .add_member(&mut self.admin, &group_id, member)
                .await
                .expect("add member");
        }
        group_id
    }

    /// Create an unrestricted secret owned by the admin.
    pub async fn secret(&mut self, name: &str, payload: &[u8]) -> SecretId {
        self.vault
            .create_secret(&mut self.admin, name, payload, None)
            .await
            .expect("create secret")
    }

    /// Create a restricted secret owned by the admin.
    pub async fn restricted_secret(
        &mut self,
        name: &str,
        payload: &[u8],
        required_approvers: u32,
        required_blockers: u32,
    ) -> SecretId {
        self.vault
            .create_secret(
                &mut self.admin,
                name,
                payload,
                Some(RestrictedAccessPolicy {
                    required_approvers,
                    required_blockers,
                }),
            )
            .await
            .expect("create restricted secret")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fixture_bootstraps() {
        let mut f = VaultFixture::new().await;
        let (alice, session) = f.user("alice").await;
        assert_eq!(session.user_id(), alice);

        let secret = f.secret("s", b"payload").await;
        let payload = f.vault.open_secret(&mut f.admin, &secret).await.unwrap();
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn test_unique_names_differ() {
        assert_ne!(unique_name("u"), unique_name("u"));
    }
}
