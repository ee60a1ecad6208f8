//! Principal key layer.
//!
//! Every user and group owns exactly one symmetric key. A user's key is
//! stored twice: wrapped under a key derived from their login secret, and
//! escrowed to the admin group for recovery. A group's key is stored once
//! per member (wrapped under that member's key) and once in escrow.
//!
//! Leaving a group deletes the member's copy of the group key. The group
//! key itself is not rotated, so a former member who kept a copy of the
//! unwrapped key could still open the group's grants.

use std::sync::Arc;

use rand::RngCore;
use tracing::{debug, info, warn};

use keyward_core::{
    escrow_principal_key, unwrap_principal_key, wrap_principal_key, EscrowPublicKey, GroupId,
    Principal, SecurityError, SymmetricKey, UserId, ValidationError, WrappedKey,
};
use keyward_store::{
    GroupRecord, MembershipRecord, Mutation, PrincipalStatus, Store, StoreExt, UserRecord,
    VaultMeta,
};

use crate::error::Result;
use crate::session::KeySession;

/// Display name of the root administrative group.
pub const ADMIN_GROUP_NAME: &str = "Administrators";

/// Turns a login secret into a user's unwrapped key.
///
/// The vault consumes this; deployments may plug in a stronger KDF or an
/// external identity check.
pub trait LoginVerifier: Send + Sync {
    /// Unwrap the user's key with their login secret.
    fn unlock(
        &self,
        user: &UserRecord,
        login_secret: &[u8],
    ) -> std::result::Result<SymmetricKey, SecurityError>;

    /// Wrap a user's key so that `unlock` can recover it.
    fn wrap(
        &self,
        user_key: &SymmetricKey,
        salt: &[u8; 16],
        login_secret: &[u8],
    ) -> std::result::Result<WrappedKey, SecurityError>;
}

/// Default verifier: BLAKE3 key derivation over `salt || secret`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DerivedKeyVerifier;

impl LoginVerifier for DerivedKeyVerifier {
    fn unlock(
        &self,
        user: &UserRecord,
        login_secret: &[u8],
    ) -> std::result::Result<SymmetricKey, SecurityError> {
        let login_key = SymmetricKey::from_login_secret(&user.login_salt, login_secret);
        unwrap_principal_key(&user.key_by_login, &login_key)
    }

    fn wrap(
        &self,
        user_key: &SymmetricKey,
        salt: &[u8; 16],
        login_secret: &[u8],
    ) -> std::result::Result<WrappedKey, SecurityError> {
        let login_key = SymmetricKey::from_login_secret(salt, login_secret);
        wrap_principal_key(user_key, &login_key)
    }
}

fn new_salt() -> [u8; 16] {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Open wrapped material with one key and seal it under another.
pub(crate) fn rewrap(
    wrapped: &WrappedKey,
    old: &SymmetricKey,
    new: &SymmetricKey,
) -> std::result::Result<WrappedKey, SecurityError> {
    let material = wrapped.open(old)?;
    WrappedKey::seal(&material, new)
}

/// Owns and unwraps user and group keys.
pub struct Principals<S> {
    store: Arc<S>,
    verifier: Arc<dyn LoginVerifier>,
    max_failed_logins: u32,
}

impl<S: Store> Principals<S> {
    /// Create the key layer over a store.
    ///
    /// `max_failed_logins` of zero disables automatic lockout.
    pub fn new(store: Arc<S>, verifier: Arc<dyn LoginVerifier>, max_failed_logins: u32) -> Self {
        Self {
            store,
            verifier,
            max_failed_logins,
        }
    }

    /// The admin escrow public key recorded at bootstrap.
    pub async fn escrow_public(&self) -> Result<EscrowPublicKey> {
        let meta = self
            .store
            .get_meta()
            .await?
            .ok_or(ValidationError::NotBootstrapped)?;
        Ok(meta.escrow_public)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Users
    // ─────────────────────────────────────────────────────────────────────────

    /// Create the admin group and its first member.
    pub async fn bootstrap(
        &self,
        admin_name: &str,
        login_secret: &[u8],
        now: i64,
    ) -> Result<KeySession> {
        if self.store.get_meta().await?.is_some() {
            return Err(ValidationError::AlreadyBootstrapped.into());
        }

        let admin_group_key = SymmetricKey::generate();
        let escrow_public = admin_group_key.escrow_secret().public_key();

        let user_key = SymmetricKey::generate();
        let user = self.new_user_record(admin_name, &user_key, login_secret, &escrow_public)?;
        let user_id = user.id;

        self.store
            .apply(vec![
                Mutation::PutMeta(VaultMeta {
                    escrow_public,
                    bootstrapped_at: now,
                }),
                Mutation::InsertGroup(GroupRecord {
                    id: GroupId::ADMIN,
                    name: ADMIN_GROUP_NAME.to_string(),
                    status: PrincipalStatus::Enabled,
                    key_by_admin: None,
                }),
                Mutation::InsertUser(user),
                Mutation::PutMembership(MembershipRecord {
                    user_id,
                    group_id: GroupId::ADMIN,
                    group_key: Some(wrap_principal_key(&admin_group_key, &user_key)?),
                }),
            ])
            .await?;

        info!(user = %user_id, "vault bootstrapped");

        let mut session = KeySession::new(user_id, user_key);
        session.remember_group(GroupId::ADMIN, admin_group_key);
        Ok(session)
    }

    /// Create a user. Their key is escrowed to the admin group immediately.
    pub async fn create_user(&self, name: &str, login_secret: &[u8]) -> Result<UserId> {
        let escrow_public = self.escrow_public().await?;
        if self.store.find_user_by_name(name).await?.is_some() {
            return Err(ValidationError::Duplicate(name.to_string()).into());
        }

        let user_key = SymmetricKey::generate();
        let user = self.new_user_record(name, &user_key, login_secret, &escrow_public)?;
        let user_id = user.id;

        self.store.apply_one(Mutation::InsertUser(user)).await?;
        debug!(user = %user_id, "user created");
        Ok(user_id)
    }

    fn new_user_record(
        &self,
        name: &str,
        user_key: &SymmetricKey,
        login_secret: &[u8],
        escrow_public: &EscrowPublicKey,
    ) -> Result<UserRecord> {
        let login_salt = new_salt();
        Ok(UserRecord {
            id: UserId::generate(),
            name: name.to_string(),
            login_salt,
            key_by_login: self.verifier.wrap(user_key, &login_salt, login_secret)?,
            key_by_admin: escrow_principal_key(user_key, escrow_public)?,
            status: PrincipalStatus::Enabled,
            failed_logins: 0,
            key_rotated_at: None,
        })
    }

    /// Get a user that has not been deleted.
    pub async fn live_user(&self, user_id: &UserId) -> Result<UserRecord> {
        match self.store.get_user(user_id).await? {
            Some(user) if user.status != PrincipalStatus::Deleted => Ok(user),
            _ => Err(ValidationError::NotFound(format!("user {}", user_id)).into()),
        }
    }

    /// Unlock a user's key with their login secret.
    ///
    /// Each failure bumps the user's failed-login counter; reaching the
    /// configured threshold disables the account. Success resets it.
    /// Neither write touches the key columns or, on success, the status.
    pub async fn unlock_with_login(&self, name: &str, login_secret: &[u8]) -> Result<KeySession> {
        let user = match self.store.find_user_by_name(name).await? {
            Some(user) if user.status != PrincipalStatus::Deleted => user,
            _ => return Err(ValidationError::LoginFailed.into()),
        };

        if user.status == PrincipalStatus::Disabled {
            return Err(ValidationError::Disabled(format!("user {}", user.name)).into());
        }

        match self.verifier.unlock(&user, login_secret) {
            Ok(key) => {
                if user.failed_logins > 0 {
                    self.store
                        .apply_one(Mutation::ResetFailedLogins(user.id))
                        .await?;
                }
                debug!(user = %user.id, "login succeeded");
                Ok(KeySession::new(user.id, key))
            }
            Err(_) => {
                self.store
                    .apply_one(Mutation::RecordFailedLogin {
                        user_id: user.id,
                        threshold: self.max_failed_logins,
                    })
                    .await?;
                let attempts = user.failed_logins.saturating_add(1);
                if self.max_failed_logins > 0 && attempts >= self.max_failed_logins {
                    warn!(user = %user.id, attempts, "user disabled after failed logins");
                }
                Err(ValidationError::LoginFailed.into())
            }
        }
    }

    /// Recover another user's key through the admin escrow.
    ///
    /// The session must belong to an admin group member.
    pub async fn unlock_via_admin(
        &self,
        admin: &mut KeySession,
        user_id: &UserId,
    ) -> Result<SymmetricKey> {
        let admin_key = self.admin_key(admin).await?;
        let user = self.live_user(user_id).await?;
        Ok(unwrap_principal_key(&user.key_by_admin, &admin_key)?)
    }

    /// The key of `user_id`: the session's own key, or admin recovery.
    pub async fn user_key_for(
        &self,
        session: &mut KeySession,
        user_id: &UserId,
    ) -> Result<SymmetricKey> {
        if *user_id == session.user_id() {
            return Ok(session.user_key().clone());
        }
        self.unlock_via_admin(session, user_id)
            .await
            .map_err(|e| match e {
                crate::PermsError::Security(SecurityError::KeyLocked(_)) => {
                    SecurityError::KeyLocked(Principal::User(*user_id)).into()
                }
                other => other,
            })
    }

    /// Enable or disable a user. Re-enabling clears the failed-login count.
    pub async fn set_user_status(&self, user_id: &UserId, status: PrincipalStatus) -> Result<()> {
        if status == PrincipalStatus::Deleted {
            return self.delete_user(user_id).await;
        }

        self.live_user(user_id).await?;
        self.store
            .apply_one(Mutation::SetUserStatus {
                user_id: *user_id,
                status,
            })
            .await?;
        info!(user = %user_id, ?status, "user status changed");
        Ok(())
    }

    /// Mark a user deleted and drop their memberships and grants.
    ///
    /// The record stays as a marker so audit entries can still name it.
    pub async fn delete_user(&self, user_id: &UserId) -> Result<()> {
        self.live_user(user_id).await?;
        let memberships = self.store.memberships_for_user(user_id).await?;

        if memberships.iter().any(|m| m.group_id.is_admin())
            && self.admin_member_count().await? <= 1
        {
            return Err(ValidationError::Protected("last administrator".into()).into());
        }

        let principal = Principal::User(*user_id);
        let grants = self.store.grants_for_principal(&principal).await?;

        let mut batch = vec![Mutation::SetUserStatus {
            user_id: *user_id,
            status: PrincipalStatus::Deleted,
        }];
        batch.extend(memberships.into_iter().map(|m| Mutation::DeleteMembership {
            user_id: m.user_id,
            group_id: m.group_id,
        }));
        batch.extend(grants.into_iter().map(|g| Mutation::DeleteGrant {
            principal,
            secret_id: g.secret_id,
        }));

        self.store.apply(batch).await?;
        info!(user = %user_id, "user deleted");
        Ok(())
    }

    /// Re-wrap the session user's key under a new login secret.
    pub async fn change_login_secret(
        &self,
        session: &KeySession,
        new_login_secret: &[u8],
    ) -> Result<()> {
        let user = self.live_user(&session.user_id()).await?;
        let salt = new_salt();
        self.store
            .apply_one(Mutation::SetUserKeys {
                user_id: user.id,
                key_by_login: self
                    .verifier
                    .wrap(session.user_key(), &salt, new_login_secret)?,
                expected_login: user.key_by_login,
                login_salt: salt,
                key_by_admin: user.key_by_admin,
                rotated_at: None,
            })
            .await?;
        debug!(user = %session.user_id(), "login secret changed");
        Ok(())
    }

    /// Replace the session user's key.
    ///
    /// The login wrapping, admin escrow, every user grant and every
    /// membership are re-wrapped and written in one atomic batch. Each
    /// re-wrap names the ciphertext it replaces, and the batch also pins the
    /// set of grants and memberships that were read. A concurrent change to
    /// any of them fails the batch with a conflict. Nothing is written then
    /// and the old key stays valid.
    pub async fn rotate_user_key(
        &self,
        session: &mut KeySession,
        login_secret: &[u8],
        now: i64,
    ) -> Result<()> {
        let user_id = session.user_id();
        let principal = Principal::User(user_id);
        let user = self.live_user(&user_id).await?;

        let current = self
            .verifier
            .unlock(&user, login_secret)
            .map_err(|_| ValidationError::LoginFailed)?;
        if &current != session.user_key() {
            return Err(SecurityError::KeyLocked(principal).into());
        }

        let escrow_public = self.escrow_public().await?;
        let old_key = session.user_key().clone();
        let new_key = SymmetricKey::generate();

        let salt = new_salt();
        let mut batch = vec![Mutation::SetUserKeys {
            user_id,
            login_salt: salt,
            key_by_login: self.verifier.wrap(&new_key, &salt, login_secret)?,
            key_by_admin: escrow_principal_key(&new_key, &escrow_public)?,
            expected_login: user.key_by_login,
            rotated_at: Some(now),
        }];

        let grants = self.store.grants_for_principal(&principal).await?;
        let grant_count = grants.len();
        batch.push(Mutation::ExpectGrants {
            principal,
            secret_ids: grants.iter().map(|g| g.secret_id).collect(),
        });
        for grant in grants {
            let read_key = grant
                .read_key
                .as_ref()
                .map(|w| rewrap(w, &old_key, &new_key))
                .transpose()?;
            let modify_key = grant
                .modify_key
                .as_ref()
                .map(|w| rewrap(w, &old_key, &new_key))
                .transpose()?;
            batch.push(Mutation::RewrapGrant {
                expected: grant,
                read_key,
                modify_key,
            });
        }

        let memberships = self.store.memberships_for_user(&user_id).await?;
        let membership_count = memberships.len();
        batch.push(Mutation::ExpectMemberships {
            user_id,
            group_ids: memberships.iter().map(|m| m.group_id).collect(),
        });
        for membership in memberships {
            let group_key = membership
                .group_key
                .as_ref()
                .map(|w| rewrap(w, &old_key, &new_key))
                .transpose()?;
            batch.push(Mutation::RewrapMembership {
                expected: membership,
                group_key,
            });
        }

        self.store.apply(batch).await?;
        session.replace_user_key(new_key);

        info!(
            user = %user_id,
            grants = grant_count,
            memberships = membership_count,
            "user key rotated"
        );
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Groups
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a group. The creator becomes its first member.
    pub async fn create_group(&self, session: &mut KeySession, name: &str) -> Result<GroupId> {
        let escrow_public = self.escrow_public().await?;
        let group_id = GroupId::generate();
        let group_key = SymmetricKey::generate();

        self.store
            .apply(vec![
                Mutation::InsertGroup(GroupRecord {
                    id: group_id,
                    name: name.to_string(),
                    status: PrincipalStatus::Enabled,
                    key_by_admin: Some(escrow_principal_key(&group_key, &escrow_public)?),
                }),
                Mutation::PutMembership(MembershipRecord {
                    user_id: session.user_id(),
                    group_id,
                    group_key: Some(wrap_principal_key(&group_key, session.user_key())?),
                }),
            ])
            .await?;

        session.remember_group(group_id, group_key);
        debug!(group = %group_id, "group created");
        Ok(group_id)
    }

    /// Get a group that has not been deleted.
    pub async fn live_group(&self, group_id: &GroupId) -> Result<GroupRecord> {
        match self.store.get_group(group_id).await? {
            Some(group) if group.status != PrincipalStatus::Deleted => Ok(group),
            _ => Err(ValidationError::NotFound(format!("group {}", group_id)).into()),
        }
    }

    /// Unwrap a group key through the session user's membership.
    async fn membership_key(
        &self,
        session: &mut KeySession,
        group_id: &GroupId,
    ) -> Result<Option<SymmetricKey>> {
        if let Some(key) = session.cached_group_key(group_id) {
            return Ok(Some(key.clone()));
        }

        let membership = self
            .store
            .get_membership(&session.user_id(), group_id)
            .await?;
        let wrapped = match membership.and_then(|m| m.group_key) {
            Some(wrapped) => wrapped,
            None => return Ok(None),
        };

        let key = unwrap_principal_key(&wrapped, session.user_key())?;
        session.remember_group(*group_id, key.clone());
        Ok(Some(key))
    }

    /// The admin group's key. Only admin group members hold it.
    pub async fn admin_key(&self, session: &mut KeySession) -> Result<SymmetricKey> {
        self.membership_key(session, &GroupId::ADMIN)
            .await?
            .ok_or_else(|| SecurityError::KeyLocked(Principal::Group(GroupId::ADMIN)).into())
    }

    /// Whether the session user is an admin group member.
    pub async fn is_admin(&self, session: &KeySession) -> Result<bool> {
        Ok(self
            .store
            .get_membership(&session.user_id(), &GroupId::ADMIN)
            .await?
            .is_some())
    }

    /// Unwrap a group key, via membership or, for admins, the escrow.
    pub async fn group_key(
        &self,
        session: &mut KeySession,
        group_id: &GroupId,
    ) -> Result<SymmetricKey> {
        if let Some(key) = self.membership_key(session, group_id).await? {
            return Ok(key);
        }

        if !group_id.is_admin() {
            if let Some(admin_key) = self.membership_key(session, &GroupId::ADMIN).await? {
                let group = self.live_group(group_id).await?;
                if let Some(escrowed) = group.key_by_admin {
                    let key = unwrap_principal_key(&escrowed, &admin_key)?;
                    session.remember_group(*group_id, key.clone());
                    return Ok(key);
                }
            }
        }

        Err(SecurityError::KeyLocked(Principal::Group(*group_id)).into())
    }

    /// Enable, disable or delete a group. The admin group is fixed.
    pub async fn set_group_status(&self, group_id: &GroupId, status: PrincipalStatus) -> Result<()> {
        if group_id.is_admin() {
            return Err(ValidationError::Protected("admin group".into()).into());
        }

        let mut group = self.live_group(group_id).await?;
        group.status = status;
        self.store.apply_one(Mutation::UpdateGroup(group)).await?;
        info!(group = %group_id, ?status, "group status changed");
        Ok(())
    }

    /// Add a user to a group by wrapping the group key under their key.
    ///
    /// The session needs the group key and the target user's key: its own,
    /// or any user's when it belongs to the admin group.
    pub async fn add_member(
        &self,
        session: &mut KeySession,
        group_id: &GroupId,
        user_id: &UserId,
    ) -> Result<()> {
        self.live_group(group_id).await?;
        self.live_user(user_id).await?;

        if self.store.get_membership(user_id, group_id).await?.is_some() {
            return Err(ValidationError::Duplicate(format!(
                "membership {} in {}",
                user_id, group_id
            ))
            .into());
        }

        let group_key = self.group_key(session, group_id).await?;
        let user_key = self.user_key_for(session, user_id).await?;

        self.store
            .apply_one(Mutation::PutMembership(MembershipRecord {
                user_id: *user_id,
                group_id: *group_id,
                group_key: Some(wrap_principal_key(&group_key, &user_key)?),
            }))
            .await?;

        debug!(group = %group_id, user = %user_id, "member added");
        Ok(())
    }

    /// Remove a user from a group.
    ///
    /// Only the membership record is deleted. The group key is not rotated.
    pub async fn remove_member(
        &self,
        session: &mut KeySession,
        group_id: &GroupId,
        user_id: &UserId,
    ) -> Result<()> {
        if self.store.get_membership(user_id, group_id).await?.is_none() {
            return Err(ValidationError::NotFound(format!(
                "membership {} in {}",
                user_id, group_id
            ))
            .into());
        }
        if group_id.is_admin() && self.admin_member_count().await? <= 1 {
            return Err(ValidationError::Protected("last administrator".into()).into());
        }

        self.store
            .apply_one(Mutation::DeleteMembership {
                user_id: *user_id,
                group_id: *group_id,
            })
            .await?;

        if *user_id == session.user_id() {
            session.forget_group(group_id);
        }
        debug!(group = %group_id, user = %user_id, "member removed");
        Ok(())
    }

    /// Current members of a group, ordered by user id.
    pub async fn members(&self, group_id: &GroupId) -> Result<Vec<UserId>> {
        Ok(self
            .store
            .members_of(group_id)
            .await?
            .into_iter()
            .map(|m| m.user_id)
            .collect())
    }

    async fn admin_member_count(&self) -> Result<usize> {
        Ok(self.store.members_of(&GroupId::ADMIN).await?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyward_store::MemoryStore;

    fn principals() -> Principals<MemoryStore> {
        Principals::new(Arc::new(MemoryStore::new()), Arc::new(DerivedKeyVerifier), 3)
    }

    #[tokio::test]
    async fn test_bootstrap_once() {
        let p = principals();
        let session = p.bootstrap("root", b"rootpw", 1).await.unwrap();
        assert!(p.is_admin(&session).await.unwrap());

        let again = p.bootstrap("root2", b"pw", 2).await;
        assert!(matches!(
            again,
            Err(crate::PermsError::Validation(ValidationError::AlreadyBootstrapped))
        ));
    }

    #[tokio::test]
    async fn test_login_unlocks_same_key() {
        let p = principals();
        p.bootstrap("root", b"rootpw", 1).await.unwrap();
        let alice = p.create_user("alice", b"alicepw").await.unwrap();

        let s1 = p.unlock_with_login("alice", b"alicepw").await.unwrap();
        let s2 = p.unlock_with_login("alice", b"alicepw").await.unwrap();
        assert_eq!(s1.user_id(), alice);
        assert_eq!(s1.user_key(), s2.user_key());
    }

    #[tokio::test]
    async fn test_failed_logins_disable_user() {
        let p = principals();
        p.bootstrap("root", b"rootpw", 1).await.unwrap();
        let alice = p.create_user("alice", b"alicepw").await.unwrap();

        for _ in 0..3 {
            assert!(p.unlock_with_login("alice", b"wrong").await.is_err());
        }
        let result = p.unlock_with_login("alice", b"alicepw").await;
        assert!(matches!(
            result,
            Err(crate::PermsError::Validation(ValidationError::Disabled(_)))
        ));

        p.set_user_status(&alice, PrincipalStatus::Enabled).await.unwrap();
        assert!(p.unlock_with_login("alice", b"alicepw").await.is_ok());
    }

    #[tokio::test]
    async fn test_admin_recovery_matches_login_key() {
        let p = principals();
        let mut admin = p.bootstrap("root", b"rootpw", 1).await.unwrap();
        let alice = p.create_user("alice", b"alicepw").await.unwrap();

        let recovered = p.unlock_via_admin(&mut admin, &alice).await.unwrap();
        let session = p.unlock_with_login("alice", b"alicepw").await.unwrap();
        assert_eq!(&recovered, session.user_key());
    }

    #[tokio::test]
    async fn test_deleted_user_cannot_be_recovered() {
        let p = principals();
        let mut admin = p.bootstrap("root", b"rootpw", 1).await.unwrap();
        let alice = p.create_user("alice", b"alicepw").await.unwrap();

        p.delete_user(&alice).await.unwrap();
        let result = p.unlock_via_admin(&mut admin, &alice).await;
        assert!(matches!(
            result,
            Err(crate::PermsError::Validation(ValidationError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_non_admin_cannot_recover() {
        let p = principals();
        let root = p.bootstrap("root", b"rootpw", 1).await.unwrap();
        p.create_user("alice", b"alicepw").await.unwrap();

        let mut alice = p.unlock_with_login("alice", b"alicepw").await.unwrap();
        let result = p.unlock_via_admin(&mut alice, &root.user_id()).await;
        assert!(matches!(
            result,
            Err(crate::PermsError::Security(SecurityError::KeyLocked(_)))
        ));
    }

    #[tokio::test]
    async fn test_membership_lifecycle() {
        let p = principals();
        let mut admin = p.bootstrap("root", b"rootpw", 1).await.unwrap();
        let alice = p.create_user("alice", b"alicepw").await.unwrap();
        let group = p.create_group(&mut admin, "ops").await.unwrap();
        let group_key = p.group_key(&mut admin, &group).await.unwrap();

        p.add_member(&mut admin, &group, &alice).await.unwrap();
        let mut session = p.unlock_with_login("alice", b"alicepw").await.unwrap();
        assert_eq!(p.group_key(&mut session, &group).await.unwrap(), group_key);

        p.remove_member(&mut admin, &group, &alice).await.unwrap();
        let mut fresh = p.unlock_with_login("alice", b"alicepw").await.unwrap();
        assert!(p.group_key(&mut fresh, &group).await.is_err());
    }

    #[tokio::test]
    async fn test_last_admin_is_protected() {
        let p = principals();
        let mut admin = p.bootstrap("root", b"rootpw", 1).await.unwrap();
        let root = admin.user_id();

        let result = p.remove_member(&mut admin, &GroupId::ADMIN, &root).await;
        assert!(matches!(
            result,
            Err(crate::PermsError::Validation(ValidationError::Protected(_)))
        ));
        assert!(p
            .set_group_status(&GroupId::ADMIN, PrincipalStatus::Disabled)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_rotate_user_key_rewraps_memberships() {
        let p = principals();
        let mut admin = p.bootstrap("root", b"rootpw", 1).await.unwrap();
        let old_key = admin.user_key().clone();
        let admin_group_key = p.admin_key(&mut admin).await.unwrap();

        p.rotate_user_key(&mut admin, b"rootpw", 10).await.unwrap();
        assert_ne!(admin.user_key(), &old_key);

        let mut fresh = p.unlock_with_login("root", b"rootpw").await.unwrap();
        assert_eq!(fresh.user_key(), admin.user_key());
        assert_eq!(p.admin_key(&mut fresh).await.unwrap(), admin_group_key);
    }

    #[tokio::test]
    async fn test_rotate_with_wrong_secret_changes_nothing() {
        let p = principals();
        let mut admin = p.bootstrap("root", b"rootpw", 1).await.unwrap();
        let old_key = admin.user_key().clone();

        assert!(p.rotate_user_key(&mut admin, b"nope", 10).await.is_err());
        let fresh = p.unlock_with_login("root", b"rootpw").await.unwrap();
        assert_eq!(fresh.user_key(), &old_key);
    }

    #[tokio::test]
    async fn test_change_login_secret() {
        let p = principals();
        p.bootstrap("root", b"rootpw", 1).await.unwrap();
        p.create_user("alice", b"old").await.unwrap();

        let session = p.unlock_with_login("alice", b"old").await.unwrap();
        p.change_login_secret(&session, b"new").await.unwrap();

        assert!(p.unlock_with_login("alice", b"old").await.is_err());
        let again = p.unlock_with_login("alice", b"new").await.unwrap();
        assert_eq!(again.user_key(), session.user_key());
    }

    #[tokio::test]
    async fn test_rotation_records_time() {
        let p = principals();
        let mut admin = p.bootstrap("root", b"rootpw", 1).await.unwrap();
        assert_eq!(p.live_user(&admin.user_id()).await.unwrap().key_rotated_at, None);

        p.rotate_user_key(&mut admin, b"rootpw", 42).await.unwrap();
        let user = p.live_user(&admin.user_id()).await.unwrap();
        assert_eq!(user.key_rotated_at, Some(42));

        p.change_login_secret(&admin, b"next").await.unwrap();
        let user = p.live_user(&admin.user_id()).await.unwrap();
        assert_eq!(user.key_rotated_at, Some(42));
    }

    #[tokio::test]
    async fn test_duplicate_user_name_rejected() {
        let p = principals();
        p.bootstrap("root", b"rootpw", 1).await.unwrap();
        p.create_user("alice", b"pw").await.unwrap();
        assert!(matches!(
            p.create_user("alice", b"pw").await,
            Err(crate::PermsError::Validation(ValidationError::Duplicate(_)))
        ));
    }

    mod interleaved {
        use std::sync::Mutex;

        use async_trait::async_trait;
        use keyward_core::{ApproverListId, RequestId, SecretId};
        use keyward_store::{
            ApproverEntry, ApproverRole, ApproverState, AuditFilter, AuditRecord, GrantRecord,
            RaRequestRecord, SecretRecord,
        };

        use super::*;

        /// Runs queued batches right after a named read returns, the way a
        /// second caller can land between a read and the write built on it.
        #[derive(Default)]
        struct Interleaved {
            inner: MemoryStore,
            queued: Mutex<Vec<(&'static str, Vec<Mutation>)>>,
        }

        impl Interleaved {
            fn after(&self, read: &'static str, batch: Vec<Mutation>) {
                self.queued.lock().unwrap().push((read, batch));
            }

            async fn run_queued(&self, read: &'static str) -> keyward_store::Result<()> {
                let due: Vec<Vec<Mutation>> = {
                    let mut queued = self.queued.lock().unwrap();
                    let (due, rest): (Vec<_>, Vec<_>) =
                        queued.drain(..).partition(|(r, _)| *r == read);
                    *queued = rest;
                    due.into_iter().map(|(_, batch)| batch).collect()
                };
                for batch in due {
                    self.inner.apply(batch).await?;
                }
                Ok(())
            }
        }

        #[async_trait]
        impl Store for Interleaved {
            async fn apply(&self, batch: Vec<Mutation>) -> keyward_store::Result<()> {
                self.inner.apply(batch).await
            }
            async fn get_meta(&self) -> keyward_store::Result<Option<VaultMeta>> {
                self.inner.get_meta().await
            }
            async fn get_user(&self, id: &UserId) -> keyward_store::Result<Option<UserRecord>> {
                self.inner.get_user(id).await
            }
            async fn find_user_by_name(
                &self,
                name: &str,
            ) -> keyward_store::Result<Option<UserRecord>> {
                let found = self.inner.find_user_by_name(name).await?;
                self.run_queued("find_user_by_name").await?;
                Ok(found)
            }
            async fn list_users(&self) -> keyward_store::Result<Vec<UserRecord>> {
                self.inner.list_users().await
            }
            async fn get_group(&self, id: &GroupId) -> keyward_store::Result<Option<GroupRecord>> {
                self.inner.get_group(id).await
            }
            async fn list_groups(&self) -> keyward_store::Result<Vec<GroupRecord>> {
                self.inner.list_groups().await
            }
            async fn get_membership(
                &self,
                user_id: &UserId,
                group_id: &GroupId,
            ) -> keyward_store::Result<Option<MembershipRecord>> {
                self.inner.get_membership(user_id, group_id).await
            }
            async fn memberships_for_user(
                &self,
                user_id: &UserId,
            ) -> keyward_store::Result<Vec<MembershipRecord>> {
                let found = self.inner.memberships_for_user(user_id).await?;
                self.run_queued("memberships_for_user").await?;
                Ok(found)
            }
            async fn members_of(
                &self,
                group_id: &GroupId,
            ) -> keyward_store::Result<Vec<MembershipRecord>> {
                self.inner.members_of(group_id).await
            }
            async fn get_grant(
                &self,
                principal: &Principal,
                secret_id: &SecretId,
            ) -> keyward_store::Result<Option<GrantRecord>> {
                self.inner.get_grant(principal, secret_id).await
            }
            async fn grants_for_secret(
                &self,
                secret_id: &SecretId,
            ) -> keyward_store::Result<Vec<GrantRecord>> {
                self.inner.grants_for_secret(secret_id).await
            }
            async fn grants_for_principal(
                &self,
                principal: &Principal,
            ) -> keyward_store::Result<Vec<GrantRecord>> {
                let found = self.inner.grants_for_principal(principal).await?;
                self.run_queued("grants_for_principal").await?;
                Ok(found)
            }
            async fn get_secret(&self, id: &SecretId) -> keyward_store::Result<Option<SecretRecord>> {
                self.inner.get_secret(id).await
            }
            async fn approver_roles(
                &self,
                secret_id: &SecretId,
            ) -> keyward_store::Result<Vec<ApproverRole>> {
                self.inner.approver_roles(secret_id).await
            }
            async fn get_request(
                &self,
                id: &RequestId,
            ) -> keyward_store::Result<Option<RaRequestRecord>> {
                self.inner.get_request(id).await
            }
            async fn latest_request(
                &self,
                secret_id: &SecretId,
                requester: &UserId,
            ) -> keyward_store::Result<Option<RaRequestRecord>> {
                self.inner.latest_request(secret_id, requester).await
            }
            async fn insert_request_if_none_live(
                &self,
                request: RaRequestRecord,
                approvers: Vec<UserId>,
                now: i64,
            ) -> keyward_store::Result<RaRequestRecord> {
                self.inner
                    .insert_request_if_none_live(request, approvers, now)
                    .await
            }
            async fn requests_awaiting(
                &self,
                approver: &UserId,
            ) -> keyward_store::Result<Vec<RaRequestRecord>> {
                self.inner.requests_awaiting(approver).await
            }
            async fn approver_entries(
                &self,
                list_id: &ApproverListId,
            ) -> keyward_store::Result<Vec<ApproverEntry>> {
                self.inner.approver_entries(list_id).await
            }
            async fn cast_vote(
                &self,
                list_id: &ApproverListId,
                user_id: &UserId,
                state: ApproverState,
            ) -> keyward_store::Result<bool> {
                self.inner.cast_vote(list_id, user_id, state).await
            }
            async fn mark_viewed(&self, id: &RequestId, at: i64) -> keyward_store::Result<bool> {
                self.inner.mark_viewed(id, at).await
            }
            async fn append_audit(&self, record: &AuditRecord) -> keyward_store::Result<u64> {
                self.inner.append_audit(record).await
            }
            async fn get_audit(&self, id: u64) -> keyward_store::Result<Option<AuditRecord>> {
                self.inner.get_audit(id).await
            }
            async fn audit_between(
                &self,
                start: i64,
                end: i64,
                filter: &AuditFilter,
            ) -> keyward_store::Result<Vec<AuditRecord>> {
                self.inner.audit_between(start, end, filter).await
            }
        }

        struct Fixture {
            store: Arc<Interleaved>,
            p: Principals<Interleaved>,
            admin: KeySession,
            alice: KeySession,
        }

        async fn fixture() -> Fixture {
            let store = Arc::new(Interleaved::default());
            let p = Principals::new(store.clone(), Arc::new(DerivedKeyVerifier), 3);
            let admin = p.bootstrap("root", b"rootpw", 1).await.unwrap();
            p.create_user("alice", b"alicepw").await.unwrap();
            let alice = p.unlock_with_login("alice", b"alicepw").await.unwrap();
            Fixture {
                store,
                p,
                admin,
                alice,
            }
        }

        async fn secret_with_grant(f: &Fixture) -> GrantRecord {
            let secret = SecretRecord {
                id: SecretId::generate(),
                name: "db".into(),
                payload: vec![1, 2, 3],
                restricted: None,
                created_at: 1,
                updated_at: 1,
            };
            let grant = GrantRecord {
                principal: Principal::User(f.alice.user_id()),
                secret_id: secret.id,
                read_key: Some(
                    wrap_principal_key(&SymmetricKey::generate(), f.alice.user_key()).unwrap(),
                ),
                modify_key: None,
            };
            f.store
                .apply(vec![Mutation::PutSecret(secret), Mutation::PutGrant(grant.clone())])
                .await
                .unwrap();
            grant
        }

        fn is_conflict(result: &Result<()>) -> bool {
            matches!(
                result,
                Err(crate::PermsError::Store(keyward_store::StoreError::Conflict(_)))
            )
        }

        #[tokio::test]
        async fn test_membership_removed_during_rotation_stays_removed() {
            let mut f = fixture().await;
            let group = f.p.create_group(&mut f.admin, "ops").await.unwrap();
            let alice_id = f.alice.user_id();
            f.p.add_member(&mut f.admin, &group, &alice_id).await.unwrap();
            let old_key = f.alice.user_key().clone();

            f.store.after(
                "memberships_for_user",
                vec![Mutation::DeleteMembership {
                    user_id: alice_id,
                    group_id: group,
                }],
            );
            let result = f.p.rotate_user_key(&mut f.alice, b"alicepw", 20).await;
            assert!(is_conflict(&result));
            assert_eq!(f.alice.user_key(), &old_key);
            assert!(f
                .store
                .get_membership(&alice_id, &group)
                .await
                .unwrap()
                .is_none());

            let relogin = f.p.unlock_with_login("alice", b"alicepw").await.unwrap();
            assert_eq!(relogin.user_key(), &old_key);

            f.p.rotate_user_key(&mut f.alice, b"alicepw", 30).await.unwrap();
            assert!(f
                .store
                .get_membership(&alice_id, &group)
                .await
                .unwrap()
                .is_none());
        }

        #[tokio::test]
        async fn test_grant_revoked_during_rotation_stays_revoked() {
            let mut f = fixture().await;
            let grant = secret_with_grant(&f).await;

            f.store.after(
                "grants_for_principal",
                vec![Mutation::DeleteGrant {
                    principal: grant.principal,
                    secret_id: grant.secret_id,
                }],
            );
            let result = f.p.rotate_user_key(&mut f.alice, b"alicepw", 20).await;
            assert!(is_conflict(&result));
            assert!(f
                .store
                .get_grant(&grant.principal, &grant.secret_id)
                .await
                .unwrap()
                .is_none());
        }

        #[tokio::test]
        async fn test_grant_added_during_rotation_fails_it() {
            let mut f = fixture().await;
            let first = secret_with_grant(&f).await;
            let old_key = f.alice.user_key().clone();

            let second = SecretRecord {
                id: SecretId::generate(),
                name: "api".into(),
                payload: vec![4],
                restricted: None,
                created_at: 1,
                updated_at: 1,
            };
            let late = GrantRecord {
                principal: first.principal,
                secret_id: second.id,
                read_key: Some(wrap_principal_key(&SymmetricKey::generate(), &old_key).unwrap()),
                modify_key: None,
            };
            f.store.after(
                "grants_for_principal",
                vec![Mutation::PutSecret(second.clone()), Mutation::PutGrant(late.clone())],
            );

            let result = f.p.rotate_user_key(&mut f.alice, b"alicepw", 20).await;
            assert!(is_conflict(&result));
            assert_eq!(f.alice.user_key(), &old_key);
            assert_eq!(
                f.store
                    .get_grant(&first.principal, &first.secret_id)
                    .await
                    .unwrap(),
                Some(first)
            );
            assert_eq!(
                f.store.get_grant(&late.principal, &second.id).await.unwrap(),
                Some(late)
            );
        }

        #[tokio::test]
        async fn test_failed_login_keeps_concurrent_password_change() {
            let f = fixture().await;
            let alice = f.p.live_user(&f.alice.user_id()).await.unwrap();
            let salt = [5u8; 16];
            let rewrapped = DerivedKeyVerifier
                .wrap(f.alice.user_key(), &salt, b"newpw")
                .unwrap();

            f.store.after(
                "find_user_by_name",
                vec![Mutation::SetUserKeys {
                    user_id: alice.id,
                    expected_login: alice.key_by_login.clone(),
                    login_salt: salt,
                    key_by_login: rewrapped,
                    key_by_admin: alice.key_by_admin.clone(),
                    rotated_at: None,
                }],
            );
            assert!(f.p.unlock_with_login("alice", b"wrong").await.is_err());

            let session = f.p.unlock_with_login("alice", b"newpw").await.unwrap();
            assert_eq!(session.user_key(), f.alice.user_key());
            let stored = f.p.live_user(&alice.id).await.unwrap();
            assert_eq!(stored.failed_logins, 0);
        }

        #[tokio::test]
        async fn test_login_reset_keeps_concurrent_disable() {
            let f = fixture().await;
            let alice_id = f.alice.user_id();
            assert!(f.p.unlock_with_login("alice", b"wrong").await.is_err());

            f.store.after(
                "find_user_by_name",
                vec![Mutation::SetUserStatus {
                    user_id: alice_id,
                    status: PrincipalStatus::Disabled,
                }],
            );
            f.p.unlock_with_login("alice", b"alicepw").await.unwrap();

            let stored = f.p.live_user(&alice_id).await.unwrap();
            assert_eq!(stored.status, PrincipalStatus::Disabled);
            assert_eq!(stored.failed_logins, 0);
        }
    }
}
