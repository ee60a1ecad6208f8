//! The Vault: the engine an application layer calls into.
//!
//! The Vault wires the principal key layer, grants, the resolver, the
//! restricted-access workflow and the audit log over one store. Every
//! operation that changes state or reveals a secret appends an audit entry,
//! on success and on security or validation failure alike.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{info, warn};

use keyward_audit::{Actor, AuditLog, AuditVerdict, Notifier};
use keyward_core::{
    open, seal, AccessMode, GroupId, Principal, RequestId, SecretId, SecretKeypair, UserId,
    ValidationError,
};
use keyward_perms::{
    DerivedKeyVerifier, GrantLevel, Grants, GroupVisibility, KeySession, LoginVerifier,
    Principals, Quorum, RequestStatus, ResolvedAccess, Resolver, SecretKeys, Vote,
};
use keyward_store::{
    ApproverEntry, AuditFilter, AuditRecord, Mutation, PrincipalStatus, RaRequestRecord,
    RestrictedAccessPolicy, SecretRecord, Store, StoreExt,
};

use crate::clock::{Clock, SystemClock};
use crate::config::VaultConfig;
use crate::error::{Result, VaultError};

fn actor(session: &KeySession) -> Actor<'_> {
    Actor::Keyed {
        user_id: session.user_id(),
        key: session.user_key(),
    }
}

/// Builder for a [`Vault`] with non-default collaborators.
pub struct VaultBuilder<S> {
    store: Arc<S>,
    config: VaultConfig,
    verifier: Arc<dyn LoginVerifier>,
    notifier: Option<Arc<dyn Notifier>>,
    clock: Arc<dyn Clock>,
}

impl<S: Store> VaultBuilder<S> {
    pub fn new(store: Arc<S>, config: VaultConfig) -> Self {
        Self {
            store,
            config,
            verifier: Arc::new(DerivedKeyVerifier),
            notifier: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use a custom login verifier.
    pub fn verifier(mut self, verifier: Arc<dyn LoginVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Forward audit entries to `notifier` when the config enables it.
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Use a custom clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Vault<S> {
        let store = self.store;
        let principals = Arc::new(Principals::new(
            store.clone(),
            self.verifier,
            self.config.max_failed_logins,
        ));

        let mut audit = AuditLog::new(store.clone());
        if self.config.notify {
            if let Some(notifier) = self.notifier {
                audit = audit.with_notifier(notifier);
            }
        }

        Vault {
            grants: Grants::new(store.clone(), principals.clone()),
            resolver: Resolver::new(store.clone(), principals.clone(), self.config.precedence),
            quorum: Quorum::new(store.clone(), self.config.ra_lifetime_ms),
            audit,
            principals,
            store,
            config: self.config,
            clock: self.clock,
        }
    }
}

/// A shared-secret vault over a store.
pub struct Vault<S: Store> {
    store: Arc<S>,
    config: VaultConfig,
    clock: Arc<dyn Clock>,
    principals: Arc<Principals<S>>,
    grants: Grants<S>,
    resolver: Resolver<S>,
    quorum: Quorum<S>,
    audit: AuditLog<S>,
}

impl<S: Store> Vault<S> {
    /// Create a vault that owns its store.
    pub fn new(store: S, config: VaultConfig) -> Self {
        Self::from_shared(Arc::new(store), config)
    }

    /// Create a vault over a store shared with other services.
    pub fn from_shared(store: Arc<S>, config: VaultConfig) -> Self {
        VaultBuilder::new(store, config).build()
    }

    pub fn builder(store: Arc<S>, config: VaultConfig) -> VaultBuilder<S> {
        VaultBuilder::new(store, config)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn principals(&self) -> &Principals<S> {
        &self.principals
    }

    fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Audit the outcome of an operation and pass it through.
    ///
    /// A failed audit write fails a successful operation. When the
    /// operation itself failed, its error wins.
    async fn audited<T>(
        &self,
        actor: Actor<'_>,
        secret_id: Option<SecretId>,
        event: &str,
        result: Result<T>,
    ) -> Result<T> {
        match &result {
            Ok(_) => {
                self.audit
                    .append(actor, secret_id, event, true, self.now())
                    .await?;
            }
            Err(e) if e.is_auditable() => {
                let text = format!("{} failed: {}", event, e);
                if let Err(audit_err) = self
                    .audit
                    .append(actor, secret_id, &text, true, self.now())
                    .await
                {
                    warn!(error = %audit_err, event, "could not audit failed operation");
                }
            }
            Err(_) => {}
        }
        result
    }

    /// Fails with `KeyLocked(admin group)` unless the session holds the
    /// admin group key.
    async fn require_admin(&self, session: &mut KeySession) -> Result<()> {
        self.principals.admin_key(session).await?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Bootstrap & Login
    // ─────────────────────────────────────────────────────────────────────────

    /// Create the admin group and first administrator.
    pub async fn bootstrap(&self, admin_name: &str, login_secret: &[u8]) -> Result<KeySession> {
        let result = self
            .principals
            .bootstrap(admin_name, login_secret, self.now())
            .await
            .map_err(VaultError::from);

        match result {
            Ok(session) => {
                info!(admin = %session.user_id(), "vault bootstrapped");
                self.audited(actor(&session), None, "Vault bootstrapped", Ok(()))
                    .await?;
                Ok(session)
            }
            Err(e) => self.audited(Actor::Nobody, None, "Vault bootstrap", Err(e)).await,
        }
    }

    /// Unlock a user's key with their login secret.
    pub async fn login(&self, name: &str, login_secret: &[u8]) -> Result<KeySession> {
        let result = self
            .principals
            .unlock_with_login(name, login_secret)
            .await
            .map_err(VaultError::from);

        match result {
            Ok(session) => {
                self.audited(actor(&session), None, "User logged in", Ok(()))
                    .await?;
                Ok(session)
            }
            Err(e) => {
                let who = match self.store.find_user_by_name(name).await? {
                    Some(user) => Actor::Unkeyed(user.id),
                    None => Actor::Nobody,
                };
                self.audited(who, None, "User login", Err(e)).await
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Users
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a user. Administrators only.
    pub async fn create_user(
        &self,
        session: &mut KeySession,
        name: &str,
        login_secret: &[u8],
    ) -> Result<UserId> {
        let result = match self.require_admin(session).await {
            Ok(()) => self
                .principals
                .create_user(name, login_secret)
                .await
                .map_err(VaultError::from),
            Err(e) => Err(e),
        };
        self.audited(actor(session), None, "User created", result).await
    }

    /// A session for another user, recovered through the admin escrow.
    pub async fn recover_user(
        &self,
        session: &mut KeySession,
        user_id: &UserId,
    ) -> Result<KeySession> {
        let result = self
            .principals
            .unlock_via_admin(session, user_id)
            .await
            .map(|key| KeySession::new(*user_id, key))
            .map_err(VaultError::from);
        self.audited(actor(session), None, "User key recovered", result)
            .await
    }

    /// Enable or disable a user. Administrators only.
    pub async fn set_user_status(
        &self,
        session: &mut KeySession,
        user_id: &UserId,
        status: PrincipalStatus,
    ) -> Result<()> {
        let result = match self.require_admin(session).await {
            Ok(()) => self
                .principals
                .set_user_status(user_id, status)
                .await
                .map_err(VaultError::from),
            Err(e) => Err(e),
        };
        self.audited(actor(session), None, "User status changed", result)
            .await
    }

    /// Delete a user, their memberships and grants. Administrators only.
    pub async fn delete_user(&self, session: &mut KeySession, user_id: &UserId) -> Result<()> {
        let result = match self.require_admin(session).await {
            Ok(()) => self
                .principals
                .delete_user(user_id)
                .await
                .map_err(VaultError::from),
            Err(e) => Err(e),
        };
        self.audited(actor(session), None, "User deleted", result).await
    }

    /// Re-wrap the session user's key under a new login secret.
    pub async fn change_login_secret(
        &self,
        session: &mut KeySession,
        new_login_secret: &[u8],
    ) -> Result<()> {
        let result = self
            .principals
            .change_login_secret(session, new_login_secret)
            .await
            .map_err(VaultError::from);
        self.audited(actor(session), None, "Login secret changed", result)
            .await
    }

    /// Replace the session user's key, re-wrapping everything under it.
    pub async fn rotate_user_key(
        &self,
        session: &mut KeySession,
        login_secret: &[u8],
    ) -> Result<()> {
        let result = self
            .principals
            .rotate_user_key(session, login_secret, self.now())
            .await
            .map_err(VaultError::from);
        self.audited(actor(session), None, "User key rotated", result)
            .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Groups
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a group with the session user as its first member.
    pub async fn create_group(&self, session: &mut KeySession, name: &str) -> Result<GroupId> {
        let result = self
            .principals
            .create_group(session, name)
            .await
            .map_err(VaultError::from);
        self.audited(actor(session), None, "Group created", result)
            .await
    }

    /// Enable, disable or delete a group. Administrators only.
    pub async fn set_group_status(
        &self,
        session: &mut KeySession,
        group_id: &GroupId,
        status: PrincipalStatus,
    ) -> Result<()> {
        let result = match self.require_admin(session).await {
            Ok(()) => self
                .principals
                .set_group_status(group_id, status)
                .await
                .map_err(VaultError::from),
            Err(e) => Err(e),
        };
        self.audited(actor(session), None, "Group status changed", result)
            .await
    }

    /// Add a user to a group.
    pub async fn add_member(
        &self,
        session: &mut KeySession,
        group_id: &GroupId,
        user_id: &UserId,
    ) -> Result<()> {
        let result = self
            .principals
            .add_member(session, group_id, user_id)
            .await
            .map_err(VaultError::from);
        self.audited(actor(session), None, "Group member added", result)
            .await
    }

    /// Remove a user from a group. Needs the group key in hand.
    pub async fn remove_member(
        &self,
        session: &mut KeySession,
        group_id: &GroupId,
        user_id: &UserId,
    ) -> Result<()> {
        let result = match self.principals.group_key(session, group_id).await {
            Ok(_) => self
                .principals
                .remove_member(session, group_id, user_id)
                .await
                .map_err(VaultError::from),
            Err(e) => Err(e.into()),
        };
        self.audited(actor(session), None, "Group member removed", result)
            .await
    }

    /// Members of a group, ordered by user id.
    pub async fn group_members(&self, group_id: &GroupId) -> Result<Vec<UserId>> {
        Ok(self.principals.members(group_id).await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Secrets
    // ─────────────────────────────────────────────────────────────────────────

    /// Store a new secret.
    ///
    /// The creator gets a modify grant and the admin group gets its
    /// permanent modify grant, in the same write.
    pub async fn create_secret(
        &self,
        session: &mut KeySession,
        name: &str,
        payload: &[u8],
        policy: Option<RestrictedAccessPolicy>,
    ) -> Result<SecretId> {
        let result = self.try_create_secret(session, name, payload, policy).await;
        let secret_id = result.as_ref().ok().copied();
        self.audited(actor(session), secret_id, "Secret created", result)
            .await
    }

    async fn try_create_secret(
        &self,
        session: &KeySession,
        name: &str,
        payload: &[u8],
        policy: Option<RestrictedAccessPolicy>,
    ) -> Result<SecretId> {
        let keypair = SecretKeypair::generate();
        let keys = SecretKeys::full(&keypair);
        let secret_id = SecretId::generate();
        let now = self.now();

        let mut batch = vec![Mutation::PutSecret(SecretRecord {
            id: secret_id,
            name: name.to_string(),
            payload: seal(payload, Some(keypair.modify_key()))?,
            restricted: policy,
            created_at: now,
            updated_at: now,
        })];
        batch.extend(self.grants.creation_grants(session, secret_id, &keys).await?);
        self.store.apply(batch).await?;

        Ok(secret_id)
    }

    async fn secret(&self, secret_id: &SecretId) -> Result<SecretRecord> {
        self.store
            .get_secret(secret_id)
            .await?
            .ok_or_else(|| ValidationError::NotFound(format!("secret {}", secret_id)).into())
    }

    /// Unlock the session user's keys for a secret.
    async fn unlock(
        &self,
        session: &mut KeySession,
        secret_id: &SecretId,
        mode: AccessMode,
    ) -> Result<(ResolvedAccess, SecretKeys)> {
        Ok(self
            .resolver
            .unlock_secret(session, secret_id, mode, GroupVisibility::EnabledOnly)
            .await?)
    }

    /// Decrypt a secret.
    ///
    /// A restricted secret also needs a granted, live request from the
    /// reader; the first successful read marks that request viewed.
    pub async fn open_secret(&self, session: &mut KeySession, secret_id: &SecretId) -> Result<Vec<u8>> {
        let result = self.try_open_secret(session, secret_id).await;
        self.audited(actor(session), Some(*secret_id), "Secret opened", result)
            .await
    }

    async fn try_open_secret(
        &self,
        session: &mut KeySession,
        secret_id: &SecretId,
    ) -> Result<Vec<u8>> {
        let (_, keys) = self.unlock(session, secret_id, AccessMode::Read).await?;
        let secret = self.secret(secret_id).await?;

        let now = self.now();
        let request = match secret.restricted {
            Some(_) => Some(
                self.quorum
                    .require_granted(&session.user_id(), secret_id, now)
                    .await?,
            ),
            None => None,
        };

        let payload = open(&secret.payload, Some(&keys.read))?;

        if let Some(request) = request {
            self.quorum.record_view(&request.id, now).await?;
        }
        Ok(payload)
    }

    /// Replace a secret's payload. Needs modify access.
    pub async fn update_secret(
        &self,
        session: &mut KeySession,
        secret_id: &SecretId,
        payload: &[u8],
    ) -> Result<()> {
        let result = self.try_update_secret(session, secret_id, payload).await;
        self.audited(actor(session), Some(*secret_id), "Secret updated", result)
            .await
    }

    async fn try_update_secret(
        &self,
        session: &mut KeySession,
        secret_id: &SecretId,
        payload: &[u8],
    ) -> Result<()> {
        let (_, keys) = self.unlock(session, secret_id, AccessMode::Modify).await?;
        let mut secret = self.secret(secret_id).await?;
        secret.payload = seal(payload, keys.modify.as_ref())?;
        secret.updated_at = self.now();
        self.store.apply_one(Mutation::PutSecret(secret)).await?;
        Ok(())
    }

    /// Set or lift a secret's restricted-access policy. Needs modify access.
    pub async fn set_restriction(
        &self,
        session: &mut KeySession,
        secret_id: &SecretId,
        policy: Option<RestrictedAccessPolicy>,
    ) -> Result<()> {
        let result = self.try_set_restriction(session, secret_id, policy).await;
        self.audited(actor(session), Some(*secret_id), "Restriction changed", result)
            .await
    }

    async fn try_set_restriction(
        &self,
        session: &mut KeySession,
        secret_id: &SecretId,
        policy: Option<RestrictedAccessPolicy>,
    ) -> Result<()> {
        self.unlock(session, secret_id, AccessMode::Modify).await?;
        let mut secret = self.secret(secret_id).await?;
        secret.restricted = policy;
        secret.updated_at = self.now();
        self.store.apply_one(Mutation::PutSecret(secret)).await?;
        Ok(())
    }

    /// Delete a secret with all its grants. Needs modify access.
    pub async fn delete_secret(&self, session: &mut KeySession, secret_id: &SecretId) -> Result<()> {
        let result = match self.unlock(session, secret_id, AccessMode::Modify).await {
            Ok(_) => self
                .store
                .apply_one(Mutation::DeleteSecret(*secret_id))
                .await
                .map_err(VaultError::from),
            Err(e) => Err(e),
        };
        self.audited(actor(session), Some(*secret_id), "Secret deleted", result)
            .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Grants
    // ─────────────────────────────────────────────────────────────────────────

    /// Give a principal access to a secret, or remove it with
    /// [`GrantLevel::None`].
    ///
    /// Granting read needs read access; granting modify or removing access
    /// needs modify access.
    pub async fn grant_access(
        &self,
        session: &mut KeySession,
        secret_id: &SecretId,
        principal: Principal,
        level: GrantLevel,
    ) -> Result<()> {
        let result = self
            .try_grant_access(session, secret_id, principal, level)
            .await;
        let event = format!("Access set to {:?} for {}", level, principal);
        self.audited(actor(session), Some(*secret_id), &event, result)
            .await
    }

    async fn try_grant_access(
        &self,
        session: &mut KeySession,
        secret_id: &SecretId,
        principal: Principal,
        level: GrantLevel,
    ) -> Result<()> {
        let mode = match level {
            GrantLevel::Read => AccessMode::Read,
            GrantLevel::Modify | GrantLevel::None => AccessMode::Modify,
        };
        let (_, keys) = self.unlock(session, secret_id, mode).await?;
        self.grants
            .grant_access(session, &keys, principal, *secret_id, level)
            .await?;
        Ok(())
    }

    /// Remove one principal's grant. Needs modify access.
    pub async fn revoke_access(
        &self,
        session: &mut KeySession,
        secret_id: &SecretId,
        principal: Principal,
    ) -> Result<()> {
        self.grant_access(session, secret_id, principal, GrantLevel::None)
            .await
    }

    /// Remove every grant except the admin group's. Needs modify access.
    pub async fn delete_all_grants(&self, session: &mut KeySession, secret_id: &SecretId) -> Result<()> {
        let result = match self.unlock(session, secret_id, AccessMode::Modify).await {
            Ok(_) => self
                .grants
                .delete_all_grants(secret_id)
                .await
                .map_err(VaultError::from),
            Err(e) => Err(e),
        };
        self.audited(actor(session), Some(*secret_id), "All grants deleted", result)
            .await
    }

    /// The grant that decides a user's access, if any.
    pub async fn resolve_access(
        &self,
        user_id: &UserId,
        secret_id: &SecretId,
        mode: AccessMode,
        visibility: GroupVisibility,
    ) -> Result<Option<ResolvedAccess>> {
        Ok(self
            .resolver
            .resolve_access(user_id, secret_id, mode, visibility)
            .await?)
    }

    /// Secrets the session user can read.
    pub async fn accessible_secrets(&self, session: &KeySession) -> Result<BTreeSet<SecretId>> {
        Ok(self.resolver.accessible_secrets(&session.user_id()).await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Restricted Access
    // ─────────────────────────────────────────────────────────────────────────

    /// Give a principal the approver role on a secret. Needs modify access.
    pub async fn assign_approver(
        &self,
        session: &mut KeySession,
        secret_id: &SecretId,
        principal: Principal,
    ) -> Result<()> {
        let result = match self.unlock(session, secret_id, AccessMode::Modify).await {
            Ok(_) => self
                .quorum
                .assign_approver(secret_id, principal)
                .await
                .map_err(VaultError::from),
            Err(e) => Err(e),
        };
        let event = format!("Approver assigned: {}", principal);
        self.audited(actor(session), Some(*secret_id), &event, result)
            .await
    }

    /// Take the approver role away. Needs modify access.
    pub async fn remove_approver(
        &self,
        session: &mut KeySession,
        secret_id: &SecretId,
        principal: Principal,
    ) -> Result<()> {
        let result = match self.unlock(session, secret_id, AccessMode::Modify).await {
            Ok(_) => self
                .quorum
                .remove_approver(secret_id, principal)
                .await
                .map_err(VaultError::from),
            Err(e) => Err(e),
        };
        let event = format!("Approver removed: {}", principal);
        self.audited(actor(session), Some(*secret_id), &event, result)
            .await
    }

    /// Ask for access to a restricted secret the session user can read.
    pub async fn create_request(
        &self,
        session: &mut KeySession,
        secret_id: &SecretId,
        reason: &str,
    ) -> Result<RaRequestRecord> {
        let result = match self.unlock(session, secret_id, AccessMode::Read).await {
            Ok(_) => self
                .quorum
                .create_request(&session.user_id(), secret_id, reason, self.now())
                .await
                .map_err(VaultError::from),
            Err(e) => Err(e),
        };
        self.audited(
            actor(session),
            Some(*secret_id),
            "Restricted access requested",
            result,
        )
        .await
    }

    /// Approve or block a request.
    pub async fn vote_on_request(
        &self,
        session: &KeySession,
        request_id: &RequestId,
        vote: Vote,
    ) -> Result<RequestStatus> {
        let secret_id = self
            .store
            .get_request(request_id)
            .await?
            .map(|r| r.secret_id);
        let result = self
            .quorum
            .vote(request_id, &session.user_id(), vote, self.now())
            .await
            .map_err(VaultError::from);
        let event = match vote {
            Vote::Approve => "Restricted access approved",
            Vote::Block => "Restricted access blocked",
        };
        self.audited(actor(session), secret_id, event, result).await
    }

    /// Evaluate a request now.
    pub async fn request_status(&self, request_id: &RequestId) -> Result<RequestStatus> {
        Ok(self.quorum.status(request_id, self.now()).await?)
    }

    /// Whether a request currently grants access.
    pub async fn is_granted(&self, request_id: &RequestId) -> Result<bool> {
        Ok(self.quorum.is_granted(request_id, self.now()).await?)
    }

    /// Live requests waiting on the session user's vote.
    pub async fn outstanding_requests(&self, session: &KeySession) -> Result<Vec<RaRequestRecord>> {
        Ok(self
            .quorum
            .outstanding_requests_for(&session.user_id(), self.now())
            .await?)
    }

    /// The approver snapshot of a request.
    pub async fn approvers_for(&self, request_id: &RequestId) -> Result<Vec<ApproverEntry>> {
        Ok(self.quorum.approvers_for(request_id).await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Audit
    // ─────────────────────────────────────────────────────────────────────────

    /// Append a caller-defined audit entry.
    pub async fn append_audit(
        &self,
        session: Option<&KeySession>,
        secret_id: Option<SecretId>,
        event: &str,
        stamp_requested: bool,
    ) -> Result<u64> {
        let who = session.map_or(Actor::Nobody, actor);
        Ok(self
            .audit
            .append(who, secret_id, event, stamp_requested, self.now())
            .await?)
    }

    /// Check an entry's stamp with the session user's key.
    pub async fn validate_audit(&self, session: &KeySession, entry_id: u64) -> Result<AuditVerdict> {
        Ok(self.audit.validate(entry_id, session.user_key()).await?)
    }

    /// Check any entry's stamp through admin recovery.
    pub async fn validate_audit_as_admin(
        &self,
        session: &mut KeySession,
        entry_id: u64,
    ) -> Result<AuditVerdict> {
        let admin_key = self.principals.admin_key(session).await?;
        Ok(self.audit.validate_as_admin(entry_id, &admin_key).await?)
    }

    /// Audit entries in a time window.
    pub async fn audit_entries(
        &self,
        start: i64,
        end: i64,
        filter: &AuditFilter,
    ) -> Result<Vec<AuditRecord>> {
        Ok(self.audit.entries_between(start, end, filter).await?)
    }
}
