//! Store trait: the abstract interface for vault persistence.
//!
//! Reads are individual methods. Writes go through [`Store::apply`], which
//! commits a batch of [`Mutation`]s atomically, so re-wrapping many keys at
//! once either fully lands or leaves the prior key material intact.

use async_trait::async_trait;

use keyward_core::{
    ApproverListId, GroupId, Principal, RequestId, SecretId, UserId,
};

use crate::error::Result;
use crate::records::{
    ApproverEntry, ApproverRole, ApproverState, AuditFilter, AuditRecord, GrantRecord,
    GroupRecord, MembershipRecord, Mutation, RaRequestRecord, SecretRecord, UserRecord,
    VaultMeta,
};

/// The Store trait: async interface for vault persistence.
///
/// All methods are async to support both sync (SQLite) and async backends.
/// For SQLite, `spawn_blocking` is used internally to avoid blocking the
/// runtime.
#[async_trait]
pub trait Store: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Batch Writes
    // ─────────────────────────────────────────────────────────────────────────

    /// Apply every mutation in one transaction. Any failure rolls back all.
    async fn apply(&self, batch: Vec<Mutation>) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // Vault Metadata
    // ─────────────────────────────────────────────────────────────────────────

    /// Get vault metadata, if bootstrapped.
    async fn get_meta(&self) -> Result<Option<VaultMeta>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Principals
    // ─────────────────────────────────────────────────────────────────────────

    /// Get a user by id.
    async fn get_user(&self, id: &UserId) -> Result<Option<UserRecord>>;

    /// Get a user by login name.
    async fn find_user_by_name(&self, name: &str) -> Result<Option<UserRecord>>;

    /// List all users ordered by id.
    async fn list_users(&self) -> Result<Vec<UserRecord>>;

    /// Get a group by id.
    async fn get_group(&self, id: &GroupId) -> Result<Option<GroupRecord>>;

    /// List all groups ordered by id.
    async fn list_groups(&self) -> Result<Vec<GroupRecord>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Memberships
    // ─────────────────────────────────────────────────────────────────────────

    /// Get a single membership.
    async fn get_membership(
        &self,
        user_id: &UserId,
        group_id: &GroupId,
    ) -> Result<Option<MembershipRecord>>;

    /// A user's memberships, ordered by group id.
    async fn memberships_for_user(&self, user_id: &UserId) -> Result<Vec<MembershipRecord>>;

    /// A group's memberships, ordered by user id.
    async fn members_of(&self, group_id: &GroupId) -> Result<Vec<MembershipRecord>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Grants
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the grant a principal holds on a secret.
    async fn get_grant(
        &self,
        principal: &Principal,
        secret_id: &SecretId,
    ) -> Result<Option<GrantRecord>>;

    /// Every grant on a secret.
    async fn grants_for_secret(&self, secret_id: &SecretId) -> Result<Vec<GrantRecord>>;

    /// Every grant a principal holds, ordered by secret id.
    async fn grants_for_principal(&self, principal: &Principal) -> Result<Vec<GrantRecord>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Secrets
    // ─────────────────────────────────────────────────────────────────────────

    /// Get a secret by id.
    async fn get_secret(&self, id: &SecretId) -> Result<Option<SecretRecord>>;

    /// Principals holding the approver role on a secret.
    async fn approver_roles(&self, secret_id: &SecretId) -> Result<Vec<ApproverRole>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Restricted Access Requests
    // ─────────────────────────────────────────────────────────────────────────

    /// Get a request by id.
    async fn get_request(&self, id: &RequestId) -> Result<Option<RaRequestRecord>>;

    /// The most recent request a user made for a secret.
    async fn latest_request(
        &self,
        secret_id: &SecretId,
        requester: &UserId,
    ) -> Result<Option<RaRequestRecord>>;

    /// Insert a request and its approver list, every entry unset, unless the
    /// requester already has a live request for the secret.
    ///
    /// The check and the insert are one transaction. Returns whichever
    /// request is live afterwards.
    async fn insert_request_if_none_live(
        &self,
        request: RaRequestRecord,
        approvers: Vec<UserId>,
        now: i64,
    ) -> Result<RaRequestRecord>;

    /// Requests whose approver list has an unset entry for this user.
    async fn requests_awaiting(&self, approver: &UserId) -> Result<Vec<RaRequestRecord>>;

    /// The approver list snapshot, ordered by user id.
    async fn approver_entries(&self, list_id: &ApproverListId) -> Result<Vec<ApproverEntry>>;

    /// Set an approver's vote in one conditional write.
    ///
    /// Returns `false` when the user is not on the list.
    async fn cast_vote(
        &self,
        list_id: &ApproverListId,
        user_id: &UserId,
        state: ApproverState,
    ) -> Result<bool>;

    /// Record the first view of a request.
    ///
    /// Returns `false` when the request was already viewed or does not exist.
    async fn mark_viewed(&self, id: &RequestId, at: i64) -> Result<bool>;

    // ─────────────────────────────────────────────────────────────────────────
    // Audit Log
    // ─────────────────────────────────────────────────────────────────────────

    /// Append an audit entry and return its assigned id.
    async fn append_audit(&self, record: &AuditRecord) -> Result<u64>;

    /// Get an audit entry by id.
    async fn get_audit(&self, id: u64) -> Result<Option<AuditRecord>>;

    /// Entries with `start <= time <= end` that pass the filter, ordered by
    /// time then id.
    async fn audit_between(
        &self,
        start: i64,
        end: i64,
        filter: &AuditFilter,
    ) -> Result<Vec<AuditRecord>>;
}

/// Extension trait for single-record writes.
#[async_trait]
pub trait StoreExt: Store {
    /// Apply a single mutation.
    async fn apply_one(&self, mutation: Mutation) -> Result<()> {
        self.apply(vec![mutation]).await
    }
}

impl<S: Store + ?Sized> StoreExt for S {}
