//! In-memory implementation of the Store trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence. Batches are staged
//! on a copy of the state and swapped in only if every mutation succeeds.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use keyward_core::{
    ApproverListId, GroupId, Principal, RequestId, SecretId, UserId,
};

use crate::error::{Result, StoreError};
use crate::records::{
    ApproverEntry, ApproverRole, ApproverState, AuditFilter, AuditRecord, GrantRecord,
    GroupRecord, MembershipRecord, Mutation, PrincipalStatus, RaRequestRecord, SecretRecord,
    UserRecord, VaultMeta,
};
use crate::traits::Store;

/// (kind, principal id) in a sortable form.
type PrincipalKey = (u8, [u8; 16]);

fn principal_key(principal: &Principal) -> PrincipalKey {
    (principal.kind() as u8, *principal.id_bytes())
}

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Clone, Default)]
struct MemoryStoreInner {
    meta: Option<VaultMeta>,
    users: BTreeMap<UserId, UserRecord>,
    groups: BTreeMap<GroupId, GroupRecord>,

    /// (user, group) -> membership.
    memberships: BTreeMap<(UserId, GroupId), MembershipRecord>,

    /// (secret, principal) -> grant.
    grants: BTreeMap<(SecretId, PrincipalKey), GrantRecord>,

    secrets: BTreeMap<SecretId, SecretRecord>,
    approver_roles: BTreeMap<(SecretId, PrincipalKey), ApproverRole>,
    requests: BTreeMap<RequestId, RaRequestRecord>,

    /// (list, user) -> vote.
    approver_lists: BTreeMap<(ApproverListId, UserId), ApproverState>,

    /// Append-only; index + 1 is the entry id.
    audit: Vec<AuditRecord>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryStoreInner::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreInner>> {
        self.inner
            .read()
            .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {}", e)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreInner>> {
        self.inner
            .write()
            .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {}", e)))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStoreInner {
    fn apply_mutation(&mut self, mutation: Mutation) -> Result<()> {
        match mutation {
            Mutation::PutMeta(meta) => {
                self.meta = Some(meta);
            }
            Mutation::InsertUser(user) => {
                if self.users.contains_key(&user.id) {
                    return Err(StoreError::Conflict(format!("user {}", user.id)));
                }
                self.check_user_name_free(&user)?;
                self.users.insert(user.id, user);
            }
            Mutation::SetUserKeys {
                user_id,
                expected_login,
                login_salt,
                key_by_login,
                key_by_admin,
                rotated_at,
            } => {
                let user = self.live_user_mut(&user_id)?;
                if user.key_by_login != expected_login {
                    return Err(StoreError::Conflict(format!("keys of user {}", user_id)));
                }
                user.login_salt = login_salt;
                user.key_by_login = key_by_login;
                user.key_by_admin = key_by_admin;
                if rotated_at.is_some() {
                    user.key_rotated_at = rotated_at;
                }
            }
            Mutation::SetUserStatus { user_id, status } => {
                let user = self.live_user_mut(&user_id)?;
                user.status = status;
                if status == PrincipalStatus::Enabled {
                    user.failed_logins = 0;
                }
            }
            Mutation::RecordFailedLogin { user_id, threshold } => {
                let user = self.live_user_mut(&user_id)?;
                user.failed_logins = user.failed_logins.saturating_add(1);
                if threshold > 0
                    && user.failed_logins >= threshold
                    && user.status == PrincipalStatus::Enabled
                {
                    user.status = PrincipalStatus::Disabled;
                }
            }
            Mutation::ResetFailedLogins(user_id) => {
                self.live_user_mut(&user_id)?.failed_logins = 0;
            }
            Mutation::InsertGroup(group) => {
                if self.groups.contains_key(&group.id) {
                    return Err(StoreError::Conflict(format!("group {}", group.id)));
                }
                self.groups.insert(group.id, group);
            }
            Mutation::UpdateGroup(group) => {
                if !self.groups.contains_key(&group.id) {
                    return Err(StoreError::NotFound(format!("group {}", group.id)));
                }
                self.groups.insert(group.id, group);
            }
            Mutation::PutMembership(membership) => {
                if !self.users.contains_key(&membership.user_id) {
                    return Err(StoreError::NotFound(format!("user {}", membership.user_id)));
                }
                if !self.groups.contains_key(&membership.group_id) {
                    return Err(StoreError::NotFound(format!(
                        "group {}",
                        membership.group_id
                    )));
                }
                self.memberships
                    .insert((membership.user_id, membership.group_id), membership);
            }
            Mutation::DeleteMembership { user_id, group_id } => {
                self.memberships.remove(&(user_id, group_id));
            }
            Mutation::RewrapMembership {
                expected,
                group_key,
            } => match self
                .memberships
                .get_mut(&(expected.user_id, expected.group_id))
            {
                Some(current) if *current == expected => current.group_key = group_key,
                _ => {
                    return Err(StoreError::Conflict(format!(
                        "membership of user {} in group {}",
                        expected.user_id, expected.group_id
                    )))
                }
            },
            Mutation::ExpectMemberships { user_id, group_ids } => {
                let mut held: Vec<GroupId> = self
                    .memberships
                    .keys()
                    .filter(|(uid, _)| *uid == user_id)
                    .map(|(_, gid)| *gid)
                    .collect();
                let mut expected = group_ids;
                held.sort();
                expected.sort();
                if held != expected {
                    return Err(StoreError::Conflict(format!(
                        "memberships of user {}",
                        user_id
                    )));
                }
            }
            Mutation::PutGrant(grant) => {
                if !self.secrets.contains_key(&grant.secret_id) {
                    return Err(StoreError::NotFound(format!("secret {}", grant.secret_id)));
                }
                self.grants
                    .insert((grant.secret_id, principal_key(&grant.principal)), grant);
            }
            Mutation::DeleteGrant {
                principal,
                secret_id,
            } => {
                self.grants.remove(&(secret_id, principal_key(&principal)));
            }
            Mutation::RewrapGrant {
                expected,
                read_key,
                modify_key,
            } => match self
                .grants
                .get_mut(&(expected.secret_id, principal_key(&expected.principal)))
            {
                Some(current) if *current == expected => {
                    current.read_key = read_key;
                    current.modify_key = modify_key;
                }
                _ => {
                    return Err(StoreError::Conflict(format!(
                        "grant of {} on secret {}",
                        expected.principal, expected.secret_id
                    )))
                }
            },
            Mutation::ExpectGrants {
                principal,
                secret_ids,
            } => {
                let key = principal_key(&principal);
                let mut held: Vec<SecretId> = self
                    .grants
                    .keys()
                    .filter(|(_, pk)| *pk == key)
                    .map(|(sid, _)| *sid)
                    .collect();
                let mut expected = secret_ids;
                held.sort();
                expected.sort();
                if held != expected {
                    return Err(StoreError::Conflict(format!("grants of {}", principal)));
                }
            }
            Mutation::DeleteGrantsForSecret(secret_id) => {
                let admin = principal_key(&Principal::Group(GroupId::ADMIN));
                self.grants
                    .retain(|(sid, pk), _| *sid != secret_id || *pk == admin);
            }
            Mutation::PutSecret(secret) => {
                self.secrets.insert(secret.id, secret);
            }
            Mutation::DeleteSecret(secret_id) => {
                self.secrets.remove(&secret_id);
                self.grants.retain(|(sid, _), _| *sid != secret_id);
                self.approver_roles.retain(|(sid, _), _| *sid != secret_id);
            }
            Mutation::PutApproverRole(role) => {
                self.approver_roles
                    .insert((role.secret_id, principal_key(&role.principal)), role);
            }
            Mutation::DeleteApproverRole(role) => {
                self.approver_roles
                    .remove(&(role.secret_id, principal_key(&role.principal)));
            }
        }
        Ok(())
    }

    /// A user that exists and is not deleted.
    fn live_user_mut(&mut self, id: &UserId) -> Result<&mut UserRecord> {
        match self.users.get_mut(id) {
            Some(user) if user.status != PrincipalStatus::Deleted => Ok(user),
            _ => Err(StoreError::NotFound(format!("user {}", id))),
        }
    }

    fn latest_request(&self, secret_id: &SecretId, requester: &UserId) -> Option<&RaRequestRecord> {
        self.requests
            .values()
            .filter(|r| r.secret_id == *secret_id && r.requester == *requester)
            .max_by_key(|r| r.request_time)
    }

    fn check_user_name_free(&self, user: &UserRecord) -> Result<()> {
        let taken = self
            .users
            .values()
            .any(|u| u.name == user.name && u.id != user.id);
        if taken {
            return Err(StoreError::Conflict(format!("user name {}", user.name)));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn apply(&self, batch: Vec<Mutation>) -> Result<()> {
        let mut inner = self.write()?;

        let mut staged = (*inner).clone();
        for mutation in batch {
            staged.apply_mutation(mutation)?;
        }
        *inner = staged;

        Ok(())
    }

    async fn get_meta(&self) -> Result<Option<VaultMeta>> {
        Ok(self.read()?.meta.clone())
    }

    async fn get_user(&self, id: &UserId) -> Result<Option<UserRecord>> {
        Ok(self.read()?.users.get(id).cloned())
    }

    async fn find_user_by_name(&self, name: &str) -> Result<Option<UserRecord>> {
        let inner = self.read()?;
        Ok(inner.users.values().find(|u| u.name == name).cloned())
    }

    async fn list_users(&self) -> Result<Vec<UserRecord>> {
        Ok(self.read()?.users.values().cloned().collect())
    }

    async fn get_group(&self, id: &GroupId) -> Result<Option<GroupRecord>> {
        Ok(self.read()?.groups.get(id).cloned())
    }

    async fn list_groups(&self) -> Result<Vec<GroupRecord>> {
        Ok(self.read()?.groups.values().cloned().collect())
    }

    async fn get_membership(
        &self,
        user_id: &UserId,
        group_id: &GroupId,
    ) -> Result<Option<MembershipRecord>> {
        Ok(self
            .read()?
            .memberships
            .get(&(*user_id, *group_id))
            .cloned())
    }

    async fn memberships_for_user(&self, user_id: &UserId) -> Result<Vec<MembershipRecord>> {
        let inner = self.read()?;
        Ok(inner
            .memberships
            .values()
            .filter(|m| m.user_id == *user_id)
            .cloned()
            .collect())
    }

    async fn members_of(&self, group_id: &GroupId) -> Result<Vec<MembershipRecord>> {
        let inner = self.read()?;
        Ok(inner
            .memberships
            .values()
            .filter(|m| m.group_id == *group_id)
            .cloned()
            .collect())
    }

    async fn get_grant(
        &self,
        principal: &Principal,
        secret_id: &SecretId,
    ) -> Result<Option<GrantRecord>> {
        Ok(self
            .read()?
            .grants
            .get(&(*secret_id, principal_key(principal)))
            .cloned())
    }

    async fn grants_for_secret(&self, secret_id: &SecretId) -> Result<Vec<GrantRecord>> {
        let inner = self.read()?;
        Ok(inner
            .grants
            .values()
            .filter(|g| g.secret_id == *secret_id)
            .cloned()
            .collect())
    }

    async fn grants_for_principal(&self, principal: &Principal) -> Result<Vec<GrantRecord>> {
        let inner = self.read()?;
        Ok(inner
            .grants
            .values()
            .filter(|g| g.principal == *principal)
            .cloned()
            .collect())
    }

    async fn get_secret(&self, id: &SecretId) -> Result<Option<SecretRecord>> {
        Ok(self.read()?.secrets.get(id).cloned())
    }

    async fn approver_roles(&self, secret_id: &SecretId) -> Result<Vec<ApproverRole>> {
        let inner = self.read()?;
        Ok(inner
            .approver_roles
            .values()
            .filter(|r| r.secret_id == *secret_id)
            .copied()
            .collect())
    }

    async fn get_request(&self, id: &RequestId) -> Result<Option<RaRequestRecord>> {
        Ok(self.read()?.requests.get(id).cloned())
    }

    async fn latest_request(
        &self,
        secret_id: &SecretId,
        requester: &UserId,
    ) -> Result<Option<RaRequestRecord>> {
        Ok(self.read()?.latest_request(secret_id, requester).cloned())
    }

    async fn insert_request_if_none_live(
        &self,
        request: RaRequestRecord,
        approvers: Vec<UserId>,
        now: i64,
    ) -> Result<RaRequestRecord> {
        let mut inner = self.write()?;
        if let Some(live) = inner
            .latest_request(&request.secret_id, &request.requester)
            .filter(|r| !r.is_expired(now))
        {
            return Ok(live.clone());
        }
        if inner.requests.contains_key(&request.id) {
            return Err(StoreError::Conflict(format!("request {}", request.id)));
        }
        for user_id in approvers {
            inner
                .approver_lists
                .insert((request.approver_list, user_id), ApproverState::Unset);
        }
        inner.requests.insert(request.id, request.clone());
        Ok(request)
    }

    async fn requests_awaiting(&self, approver: &UserId) -> Result<Vec<RaRequestRecord>> {
        let inner = self.read()?;
        let mut requests: Vec<RaRequestRecord> = inner
            .requests
            .values()
            .filter(|r| {
                inner.approver_lists.get(&(r.approver_list, *approver))
                    == Some(&ApproverState::Unset)
            })
            .cloned()
            .collect();
        requests.sort_by_key(|r| r.request_time);
        Ok(requests)
    }

    async fn approver_entries(&self, list_id: &ApproverListId) -> Result<Vec<ApproverEntry>> {
        let inner = self.read()?;
        Ok(inner
            .approver_lists
            .iter()
            .filter(|((lid, _), _)| lid == list_id)
            .map(|((lid, uid), state)| ApproverEntry {
                list_id: *lid,
                user_id: *uid,
                state: *state,
            })
            .collect())
    }

    async fn cast_vote(
        &self,
        list_id: &ApproverListId,
        user_id: &UserId,
        state: ApproverState,
    ) -> Result<bool> {
        let mut inner = self.write()?;
        match inner.approver_lists.get_mut(&(*list_id, *user_id)) {
            Some(current) => {
                *current = state;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_viewed(&self, id: &RequestId, at: i64) -> Result<bool> {
        let mut inner = self.write()?;
        match inner.requests.get_mut(id) {
            Some(request) if request.viewed_time.is_none() => {
                request.viewed_time = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn append_audit(&self, record: &AuditRecord) -> Result<u64> {
        let mut inner = self.write()?;
        let id = inner.audit.len() as u64 + 1;
        let mut stored = record.clone();
        stored.id = id;
        inner.audit.push(stored);
        Ok(id)
    }

    async fn get_audit(&self, id: u64) -> Result<Option<AuditRecord>> {
        let inner = self.read()?;
        Ok(id
            .checked_sub(1)
            .and_then(|index| inner.audit.get(index as usize))
            .cloned())
    }

    async fn audit_between(
        &self,
        start: i64,
        end: i64,
        filter: &AuditFilter,
    ) -> Result<Vec<AuditRecord>> {
        let inner = self.read()?;
        let mut entries: Vec<AuditRecord> = inner
            .audit
            .iter()
            .filter(|r| r.time >= start && r.time <= end && filter.matches(r))
            .cloned()
            .collect();
        entries.sort_by_key(|r| (r.time, r.id));
        Ok(entries)
    }
}
