//! Persisted record types.
//!
//! These are plain data. All key material inside them is already wrapped;
//! nothing in this crate can unwrap it.

use serde::{Deserialize, Serialize};

use keyward_core::{
    ApproverListId, EscrowPublicKey, GrantKind, GroupId, Principal, RequestId, SecretId, UserId,
    WrappedKey,
};

/// Status of a user or group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PrincipalStatus {
    Enabled = 0,
    Disabled = 1,
    /// Users keep a deleted marker row so audit entries can still name them.
    Deleted = 2,
}

impl PrincipalStatus {
    /// Convert from the stored discriminant.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PrincipalStatus::Enabled),
            1 => Some(PrincipalStatus::Disabled),
            2 => Some(PrincipalStatus::Deleted),
            _ => None,
        }
    }

    /// Whether the principal is enabled.
    pub fn is_enabled(&self) -> bool {
        matches!(self, PrincipalStatus::Enabled)
    }
}

/// Vault-wide metadata written once at bootstrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultMeta {
    /// Public half of the admin escrow key.
    pub escrow_public: EscrowPublicKey,
    /// When the vault was bootstrapped (Unix ms).
    pub bootstrapped_at: i64,
}

/// A user principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: UserId,
    pub name: String,
    /// Salt mixed into the login-derived wrapping key.
    pub login_salt: [u8; 16],
    /// The user's key wrapped under their login-derived key.
    pub key_by_login: WrappedKey,
    /// The user's key escrowed to the admin group (recovery path).
    pub key_by_admin: WrappedKey,
    pub status: PrincipalStatus,
    /// Consecutive failed logins since the last success.
    pub failed_logins: u32,
    /// When the current key replaced an earlier one (Unix ms).
    ///
    /// Audit stamps made at or before this time were keyed with a retired key.
    pub key_rotated_at: Option<i64>,
}

/// A group principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    pub id: GroupId,
    pub name: String,
    pub status: PrincipalStatus,
    /// The group's key escrowed to the admin group.
    ///
    /// `None` only for the admin group itself.
    pub key_by_admin: Option<WrappedKey>,
}

/// A user's membership of a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipRecord {
    pub user_id: UserId,
    pub group_id: GroupId,
    /// The group's key wrapped under the user's key.
    pub group_key: Option<WrappedKey>,
}

/// A per-(principal, secret) grant.
///
/// No read key means no access. A read key without a modify key is
/// read-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantRecord {
    pub principal: Principal,
    pub secret_id: SecretId,
    pub read_key: Option<WrappedKey>,
    pub modify_key: Option<WrappedKey>,
}

impl GrantRecord {
    /// The grant kind, derived from the owning principal.
    pub fn kind(&self) -> GrantKind {
        self.principal.kind()
    }

    /// Whether this grant allows reading.
    pub fn can_read(&self) -> bool {
        self.read_key.is_some()
    }

    /// Whether this grant allows both reading and modifying.
    pub fn can_modify(&self) -> bool {
        self.read_key.is_some() && self.modify_key.is_some()
    }
}

/// Quorum thresholds for a restricted secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestrictedAccessPolicy {
    pub required_approvers: u32,
    /// Zero disables blocking.
    pub required_blockers: u32,
}

/// A stored secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRecord {
    pub id: SecretId,
    pub name: String,
    /// Output of `seal`.
    pub payload: Vec<u8>,
    pub restricted: Option<RestrictedAccessPolicy>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Assignment of the approver role on a secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ApproverRole {
    pub secret_id: SecretId,
    pub principal: Principal,
}

/// A restricted-access request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaRequestRecord {
    pub id: RequestId,
    pub secret_id: SecretId,
    pub requester: UserId,
    pub approver_list: ApproverListId,
    pub request_time: i64,
    pub viewed_time: Option<i64>,
    pub reason: String,
    /// Validity window, fixed when the request was created.
    pub lifetime_ms: i64,
}

impl RaRequestRecord {
    /// When this request stops being valid.
    pub fn expires_at(&self) -> i64 {
        let start = match self.viewed_time {
            Some(viewed) => self.request_time.max(viewed),
            None => self.request_time,
        };
        start.saturating_add(self.lifetime_ms)
    }

    /// Whether the request has expired at `now`.
    pub fn is_expired(&self, now: i64) -> bool {
        now > self.expires_at()
    }
}

/// An approver's vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ApproverState {
    Unset = 0,
    Approve = 1,
    Block = 2,
}

impl ApproverState {
    /// Convert from the stored discriminant.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ApproverState::Unset),
            1 => Some(ApproverState::Approve),
            2 => Some(ApproverState::Block),
            _ => None,
        }
    }
}

/// One row of an approver list snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApproverEntry {
    pub list_id: ApproverListId,
    pub user_id: UserId,
    pub state: ApproverState,
}

/// An audit log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    /// Assigned by the store on append; ignored on input.
    pub id: u64,
    pub time: i64,
    pub secret_id: Option<SecretId>,
    /// [`UserId::NONE`] when no user acted.
    pub user_id: UserId,
    pub event: String,
    pub stamp: Option<Vec<u8>>,
}

impl AuditRecord {
    /// The acting user, unless the entry carries the no-user sentinel.
    pub fn acting_user(&self) -> Option<UserId> {
        if self.user_id == UserId::NONE {
            None
        } else {
            Some(self.user_id)
        }
    }
}

/// Filter for audit range queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuditFilter {
    pub user_id: Option<UserId>,
    pub secret_id: Option<SecretId>,
}

impl AuditFilter {
    /// Whether a record passes this filter.
    pub fn matches(&self, record: &AuditRecord) -> bool {
        self.user_id.map_or(true, |u| record.user_id == u)
            && self.secret_id.map_or(true, |s| record.secret_id == Some(s))
    }
}

/// A single write in an atomic batch.
///
/// Writes that replace existing rows name the values they expect to
/// replace. A row that changed since it was read fails the whole batch with
/// a conflict instead of being silently overwritten.
#[derive(Debug, Clone)]
pub enum Mutation {
    PutMeta(VaultMeta),
    /// Fails with a conflict if the id or name is taken.
    InsertUser(UserRecord),
    /// Replaces a live user's key wrappings.
    ///
    /// Fails with a conflict unless the stored login wrapping still equals
    /// `expected_login`. `rotated_at` is set only when the key itself changed.
    SetUserKeys {
        user_id: UserId,
        expected_login: WrappedKey,
        login_salt: [u8; 16],
        key_by_login: WrappedKey,
        key_by_admin: WrappedKey,
        rotated_at: Option<i64>,
    },
    /// Sets the status of a user that is not deleted. Enabling also clears
    /// the failed-login count.
    SetUserStatus {
        user_id: UserId,
        status: PrincipalStatus,
    },
    /// Counts a failed login. Reaching a non-zero `threshold` disables an
    /// enabled user.
    RecordFailedLogin { user_id: UserId, threshold: u32 },
    /// Clears the failed-login count without touching the status.
    ResetFailedLogins(UserId),
    InsertGroup(GroupRecord),
    UpdateGroup(GroupRecord),
    PutMembership(MembershipRecord),
    DeleteMembership { user_id: UserId, group_id: GroupId },
    /// Replaces a membership's wrapped group key.
    ///
    /// Fails with a conflict unless the row still equals `expected`.
    RewrapMembership {
        expected: MembershipRecord,
        group_key: Option<WrappedKey>,
    },
    /// Fails with a conflict unless the user's memberships are exactly
    /// these groups.
    ExpectMemberships {
        user_id: UserId,
        group_ids: Vec<GroupId>,
    },
    PutGrant(GrantRecord),
    DeleteGrant { principal: Principal, secret_id: SecretId },
    /// Replaces a grant's wrapped keys.
    ///
    /// Fails with a conflict unless the row still equals `expected`.
    RewrapGrant {
        expected: GrantRecord,
        read_key: Option<WrappedKey>,
        modify_key: Option<WrappedKey>,
    },
    /// Fails with a conflict unless the principal's grants cover exactly
    /// these secrets.
    ExpectGrants {
        principal: Principal,
        secret_ids: Vec<SecretId>,
    },
    /// Removes every grant on the secret except the admin group's.
    DeleteGrantsForSecret(SecretId),
    PutSecret(SecretRecord),
    /// Removes the secret together with all its grants and approver roles.
    DeleteSecret(SecretId),
    PutApproverRole(ApproverRole),
    DeleteApproverRole(ApproverRole),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(request_time: i64, viewed_time: Option<i64>) -> RaRequestRecord {
        RaRequestRecord {
            id: RequestId::generate(),
            secret_id: SecretId::generate(),
            requester: UserId::generate(),
            approver_list: ApproverListId::generate(),
            request_time,
            viewed_time,
            reason: "audit".into(),
            lifetime_ms: 1_000,
        }
    }

    #[test]
    fn test_request_expiry_window() {
        let req = request(10_000, None);
        assert!(!req.is_expired(10_999));
        assert!(!req.is_expired(11_000));
        assert!(req.is_expired(11_001));
    }

    #[test]
    fn test_view_extends_expiry() {
        let req = request(10_000, Some(10_500));
        assert_eq!(req.expires_at(), 11_500);
        assert!(!req.is_expired(11_400));
    }

    #[test]
    fn test_audit_sentinel_user() {
        let record = AuditRecord {
            id: 0,
            time: 1,
            secret_id: None,
            user_id: UserId::NONE,
            event: "x".into(),
            stamp: None,
        };
        assert_eq!(record.acting_user(), None);
    }

    #[test]
    fn test_grant_levels() {
        let grant = GrantRecord {
            principal: Principal::User(UserId::generate()),
            secret_id: SecretId::generate(),
            read_key: Some(WrappedKey::Sealed {
                nonce: keyward_core::EncryptionNonce::from_bytes([0; 12]),
                ciphertext: vec![1],
            }),
            modify_key: None,
        };
        assert!(grant.can_read());
        assert!(!grant.can_modify());
        assert_eq!(grant.kind(), GrantKind::User);
    }
}
