//! Restricted-access quorum workflow.
//!
//! A restricted secret can only be opened through a request that enough
//! approvers have signed off on. The set of eligible approvers is
//! snapshotted when the request is created; later role or membership
//! changes do not affect it. Expiry is evaluated lazily on every read.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info};

use keyward_core::{
    ApproverListId, Principal, RequestId, SecretId, UserId, ValidationError,
};
use keyward_store::{
    ApproverEntry, ApproverRole, ApproverState, Mutation, PrincipalStatus, RaRequestRecord,
    RestrictedAccessPolicy, Store, StoreExt,
};

use crate::error::Result;

/// Evaluated state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestStatus {
    Pending,
    Granted,
    Blocked,
    Expired,
}

/// A vote an approver can cast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vote {
    Approve,
    Block,
}

impl From<Vote> for ApproverState {
    fn from(vote: Vote) -> Self {
        match vote {
            Vote::Approve => ApproverState::Approve,
            Vote::Block => ApproverState::Block,
        }
    }
}

/// Apply a policy to vote counts.
///
/// Blocking wins only when the blocker threshold is met on its own;
/// otherwise enough approvals grant access.
pub fn evaluate(policy: &RestrictedAccessPolicy, approves: u32, blocks: u32) -> RequestStatus {
    if policy.required_blockers > 0 && blocks >= policy.required_blockers {
        RequestStatus::Blocked
    } else if approves >= policy.required_approvers {
        RequestStatus::Granted
    } else {
        RequestStatus::Pending
    }
}

/// Drives restricted-access requests.
pub struct Quorum<S> {
    store: Arc<S>,
    lifetime_ms: i64,
}

impl<S: Store> Quorum<S> {
    /// `lifetime_ms` is snapshotted into each new request.
    pub fn new(store: Arc<S>, lifetime_ms: i64) -> Self {
        Self { store, lifetime_ms }
    }

    pub fn lifetime_ms(&self) -> i64 {
        self.lifetime_ms
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Approver roles
    // ─────────────────────────────────────────────────────────────────────────

    /// Give a user or group the approver role on a secret.
    pub async fn assign_approver(&self, secret_id: &SecretId, principal: Principal) -> Result<()> {
        if self.store.get_secret(secret_id).await?.is_none() {
            return Err(ValidationError::NotFound(format!("secret {}", secret_id)).into());
        }
        self.store
            .apply_one(Mutation::PutApproverRole(ApproverRole {
                secret_id: *secret_id,
                principal,
            }))
            .await?;
        debug!(secret = %secret_id, %principal, "approver assigned");
        Ok(())
    }

    /// Take the approver role away. Existing snapshots keep the user.
    pub async fn remove_approver(&self, secret_id: &SecretId, principal: Principal) -> Result<()> {
        self.store
            .apply_one(Mutation::DeleteApproverRole(ApproverRole {
                secret_id: *secret_id,
                principal,
            }))
            .await?;
        debug!(secret = %secret_id, %principal, "approver removed");
        Ok(())
    }

    /// Users currently eligible to approve, excluding `requester`.
    ///
    /// Direct role holders count when enabled; group role holders
    /// contribute their enabled members when the group itself is enabled.
    pub async fn eligible_approvers(
        &self,
        secret_id: &SecretId,
        requester: &UserId,
    ) -> Result<BTreeSet<UserId>> {
        let mut eligible = BTreeSet::new();

        for role in self.store.approver_roles(secret_id).await? {
            match role.principal {
                Principal::User(user_id) => {
                    if self.user_enabled(&user_id).await? {
                        eligible.insert(user_id);
                    }
                }
                Principal::Group(group_id) => {
                    let enabled = self
                        .store
                        .get_group(&group_id)
                        .await?
                        .map_or(false, |g| g.status.is_enabled());
                    if !enabled {
                        continue;
                    }
                    for member in self.store.members_of(&group_id).await? {
                        if self.user_enabled(&member.user_id).await? {
                            eligible.insert(member.user_id);
                        }
                    }
                }
            }
        }

        eligible.remove(requester);
        Ok(eligible)
    }

    async fn user_enabled(&self, user_id: &UserId) -> Result<bool> {
        Ok(self
            .store
            .get_user(user_id)
            .await?
            .map_or(false, |u| u.status == PrincipalStatus::Enabled))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Requests
    // ─────────────────────────────────────────────────────────────────────────

    /// Ask for access to a restricted secret.
    ///
    /// If the requester already has a live request for the secret, that
    /// request is returned instead of creating a new one.
    pub async fn create_request(
        &self,
        requester: &UserId,
        secret_id: &SecretId,
        reason: &str,
        now: i64,
    ) -> Result<RaRequestRecord> {
        let secret = self
            .store
            .get_secret(secret_id)
            .await?
            .ok_or_else(|| ValidationError::NotFound(format!("secret {}", secret_id)))?;
        if secret.restricted.is_none() {
            return Err(ValidationError::NotFound(format!(
                "restricted access policy on secret {}",
                secret_id
            ))
            .into());
        }

        if let Some(existing) = self.store.latest_request(secret_id, requester).await? {
            if !existing.is_expired(now) {
                debug!(request = %existing.id, "returning live request");
                return Ok(existing);
            }
        }

        let approvers: Vec<UserId> = self
            .eligible_approvers(secret_id, requester)
            .await?
            .into_iter()
            .collect();

        let request = RaRequestRecord {
            id: RequestId::generate(),
            secret_id: *secret_id,
            requester: *requester,
            approver_list: ApproverListId::generate(),
            request_time: now,
            viewed_time: None,
            reason: reason.to_string(),
            lifetime_ms: self.lifetime_ms,
        };

        // A concurrent request may have landed since the lookup above.
        let request_id = request.id;
        let approver_count = approvers.len();
        let stored = self
            .store
            .insert_request_if_none_live(request, approvers, now)
            .await?;
        if stored.id != request_id {
            debug!(request = %stored.id, "returning concurrently created request");
            return Ok(stored);
        }

        info!(
            request = %stored.id,
            secret = %secret_id,
            requester = %requester,
            approvers = approver_count,
            "restricted access requested"
        );
        Ok(stored)
    }

    async fn request(&self, request_id: &RequestId) -> Result<RaRequestRecord> {
        self.store
            .get_request(request_id)
            .await?
            .ok_or_else(|| ValidationError::NotFound(format!("request {}", request_id)).into())
    }

    /// Cast or replace a vote. Returns the status after the vote.
    pub async fn vote(
        &self,
        request_id: &RequestId,
        voter: &UserId,
        vote: Vote,
        now: i64,
    ) -> Result<RequestStatus> {
        let request = self.request(request_id).await?;
        if request.is_expired(now) {
            return Err(ValidationError::Expired(*request_id).into());
        }

        if !self
            .store
            .cast_vote(&request.approver_list, voter, vote.into())
            .await?
        {
            return Err(ValidationError::NotAnApprover(*request_id).into());
        }

        debug!(request = %request_id, voter = %voter, ?vote, "vote cast");
        self.status_of(&request, now).await
    }

    /// Evaluate a request at `now`.
    pub async fn status(&self, request_id: &RequestId, now: i64) -> Result<RequestStatus> {
        let request = self.request(request_id).await?;
        self.status_of(&request, now).await
    }

    /// Evaluate a loaded request against the secret's current policy.
    ///
    /// A secret whose policy has been lifted treats every live request as
    /// granted.
    pub async fn status_of(&self, request: &RaRequestRecord, now: i64) -> Result<RequestStatus> {
        if request.is_expired(now) {
            return Ok(RequestStatus::Expired);
        }

        let secret = self
            .store
            .get_secret(&request.secret_id)
            .await?
            .ok_or_else(|| ValidationError::NotFound(format!("secret {}", request.secret_id)))?;
        let policy = match secret.restricted {
            Some(policy) => policy,
            None => return Ok(RequestStatus::Granted),
        };

        let entries = self.store.approver_entries(&request.approver_list).await?;
        let approves = entries
            .iter()
            .filter(|e| e.state == ApproverState::Approve)
            .count() as u32;
        let blocks = entries
            .iter()
            .filter(|e| e.state == ApproverState::Block)
            .count() as u32;

        Ok(evaluate(&policy, approves, blocks))
    }

    /// Whether the request currently grants access.
    pub async fn is_granted(&self, request_id: &RequestId, now: i64) -> Result<bool> {
        Ok(self.status(request_id, now).await? == RequestStatus::Granted)
    }

    /// Record the first view of a request, extending its window.
    pub async fn record_view(&self, request_id: &RequestId, now: i64) -> Result<bool> {
        let first = self.store.mark_viewed(request_id, now).await?;
        if first {
            debug!(request = %request_id, "request viewed");
        }
        Ok(first)
    }

    /// The requester's latest request for a secret, if it grants access.
    ///
    /// Each non-granted outcome is its own typed rejection.
    pub async fn require_granted(
        &self,
        requester: &UserId,
        secret_id: &SecretId,
        now: i64,
    ) -> Result<RaRequestRecord> {
        let request = self
            .store
            .latest_request(secret_id, requester)
            .await?
            .ok_or(ValidationError::RestrictedAccessRequired(*secret_id))?;

        match self.status_of(&request, now).await? {
            RequestStatus::Granted => Ok(request),
            RequestStatus::Pending => Err(ValidationError::QuorumNotMet(request.id).into()),
            RequestStatus::Blocked => Err(ValidationError::Blocked(request.id).into()),
            RequestStatus::Expired => Err(ValidationError::Expired(request.id).into()),
        }
    }

    /// Live requests still waiting on this approver's vote.
    pub async fn outstanding_requests_for(
        &self,
        approver: &UserId,
        now: i64,
    ) -> Result<Vec<RaRequestRecord>> {
        Ok(self
            .store
            .requests_awaiting(approver)
            .await?
            .into_iter()
            .filter(|r| !r.is_expired(now))
            .collect())
    }

    /// The approver snapshot of a request with each vote.
    pub async fn approvers_for(&self, request_id: &RequestId) -> Result<Vec<ApproverEntry>> {
        let request = self.request(request_id).await?;
        Ok(self.store.approver_entries(&request.approver_list).await?)
    }
}
