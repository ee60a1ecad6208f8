//! Access resolution.
//!
//! Given a user and a secret, pick the grant that decides access. Grant
//! kinds are tried in precedence order and the first kind that yields a
//! readable grant wins; for modify access the winner must also carry the
//! modify-key. A lower-precedence kind is never consulted once a higher one
//! has produced a readable grant.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use keyward_core::{AccessMode, GrantKind, Principal, SecretId, SecurityError, UserId};
use keyward_store::{GrantRecord, PrincipalStatus, Store};

use crate::error::Result;
use crate::grants::{open_grant, SecretKeys};
use crate::principal::Principals;
use crate::session::KeySession;

/// Which grant kind wins when a user holds both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Precedence {
    #[default]
    UserFirst,
    GroupFirst,
}

impl Precedence {
    /// Grant kinds in lookup order.
    pub fn order(&self) -> [GrantKind; 2] {
        match self {
            Precedence::UserFirst => [GrantKind::User, GrantKind::Group],
            Precedence::GroupFirst => [GrantKind::Group, GrantKind::User],
        }
    }
}

impl fmt::Display for Precedence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Precedence::UserFirst => f.write_str("user-first"),
            Precedence::GroupFirst => f.write_str("group-first"),
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown precedence mode: {0}")]
pub struct UnknownPrecedence(pub String);

impl FromStr for Precedence {
    type Err = UnknownPrecedence;

    /// Accepts the short configuration codes `U` and `G` as well as the
    /// long names.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "U" | "u" | "user-first" => Ok(Precedence::UserFirst),
            "G" | "g" | "group-first" => Ok(Precedence::GroupFirst),
            other => Err(UnknownPrecedence(other.to_string())),
        }
    }
}

/// Whether disabled groups take part in resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GroupVisibility {
    #[default]
    EnabledOnly,
    /// Administrative cleanup and recovery only.
    EvenIfDisabled,
}

/// The grant that decides a user's access, and whose it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAccess {
    pub via: Principal,
    pub grant: GrantRecord,
}

impl ResolvedAccess {
    /// Whether the winning grant also carries the modify-key.
    pub fn can_modify(&self) -> bool {
        self.grant.can_modify()
    }
}

/// Resolves effective access under a fixed precedence.
pub struct Resolver<S> {
    store: Arc<S>,
    principals: Arc<Principals<S>>,
    precedence: Precedence,
}

impl<S: Store> Resolver<S> {
    pub fn new(store: Arc<S>, principals: Arc<Principals<S>>, precedence: Precedence) -> Self {
        Self {
            store,
            principals,
            precedence,
        }
    }

    /// The configured precedence.
    pub fn precedence(&self) -> Precedence {
        self.precedence
    }

    /// Pick the grant that decides `user_id`'s access to a secret.
    ///
    /// Returns `None` when no usable grant exists for `mode`.
    pub async fn resolve_access(
        &self,
        user_id: &UserId,
        secret_id: &SecretId,
        mode: AccessMode,
        visibility: GroupVisibility,
    ) -> Result<Option<ResolvedAccess>> {
        for kind in self.precedence.order() {
            let found = match kind {
                GrantKind::User => self.user_grant(user_id, secret_id).await?,
                GrantKind::Group => self.group_grant(user_id, secret_id, visibility).await?,
            };

            if let Some(found) = found {
                let usable = mode == AccessMode::Read || found.can_modify();
                debug!(
                    user = %user_id,
                    secret = %secret_id,
                    via = %found.via,
                    ?mode,
                    usable,
                    "access resolved"
                );
                return Ok(usable.then_some(found));
            }
        }

        debug!(user = %user_id, secret = %secret_id, ?mode, "no grant found");
        Ok(None)
    }

    async fn user_grant(
        &self,
        user_id: &UserId,
        secret_id: &SecretId,
    ) -> Result<Option<ResolvedAccess>> {
        let via = Principal::User(*user_id);
        Ok(self
            .store
            .get_grant(&via, secret_id)
            .await?
            .filter(GrantRecord::can_read)
            .map(|grant| ResolvedAccess { via, grant }))
    }

    /// A full group grant if any reachable group has one, else the first
    /// read-only one. Groups are visited in id order.
    async fn group_grant(
        &self,
        user_id: &UserId,
        secret_id: &SecretId,
        visibility: GroupVisibility,
    ) -> Result<Option<ResolvedAccess>> {
        let mut read_only = None;

        for membership in self.store.memberships_for_user(user_id).await? {
            let group_id = membership.group_id;
            if !self.group_visible(&membership.group_id, visibility).await? {
                continue;
            }

            let via = Principal::Group(group_id);
            let grant = match self.store.get_grant(&via, secret_id).await? {
                Some(grant) if grant.can_read() => grant,
                _ => continue,
            };

            if grant.can_modify() {
                return Ok(Some(ResolvedAccess { via, grant }));
            }
            if read_only.is_none() {
                read_only = Some(ResolvedAccess { via, grant });
            }
        }

        Ok(read_only)
    }

    async fn group_visible(
        &self,
        group_id: &keyward_core::GroupId,
        visibility: GroupVisibility,
    ) -> Result<bool> {
        Ok(match self.store.get_group(group_id).await? {
            Some(group) => match group.status {
                PrincipalStatus::Enabled => true,
                PrincipalStatus::Disabled => visibility == GroupVisibility::EvenIfDisabled,
                PrincipalStatus::Deleted => false,
            },
            None => false,
        })
    }

    /// Unwrap the secret keys held by a resolved grant.
    pub async fn unlock_grant(
        &self,
        session: &mut KeySession,
        resolved: &ResolvedAccess,
    ) -> Result<SecretKeys> {
        let key = match &resolved.via {
            Principal::User(id) => self.principals.user_key_for(session, id).await?,
            Principal::Group(id) => self.principals.group_key(session, id).await?,
        };
        open_grant(&resolved.grant, &key)
    }

    /// Resolve the session user's access and unwrap the keys in one step.
    ///
    /// A missing grant is an [`SecurityError::AccessDenied`].
    pub async fn unlock_secret(
        &self,
        session: &mut KeySession,
        secret_id: &SecretId,
        mode: AccessMode,
        visibility: GroupVisibility,
    ) -> Result<(ResolvedAccess, SecretKeys)> {
        let resolved = self
            .resolve_access(&session.user_id(), secret_id, mode, visibility)
            .await?
            .ok_or_else(|| SecurityError::AccessDenied {
                secret: *secret_id,
                reason: match mode {
                    AccessMode::Read => "no read grant".to_string(),
                    AccessMode::Modify => "no modify grant".to_string(),
                },
            })?;
        let keys = self.unlock_grant(session, &resolved).await?;
        Ok((resolved, keys))
    }

    /// Every secret the user can read via a direct grant or an enabled
    /// group.
    pub async fn accessible_secrets(&self, user_id: &UserId) -> Result<BTreeSet<SecretId>> {
        let mut secrets: BTreeSet<SecretId> = self
            .store
            .grants_for_principal(&Principal::User(*user_id))
            .await?
            .into_iter()
            .filter(GrantRecord::can_read)
            .map(|g| g.secret_id)
            .collect();

        for membership in self.store.memberships_for_user(user_id).await? {
            if !self
                .group_visible(&membership.group_id, GroupVisibility::EnabledOnly)
                .await?
            {
                continue;
            }
            secrets.extend(
                self.store
                    .grants_for_principal(&Principal::Group(membership.group_id))
                    .await?
                    .into_iter()
                    .filter(GrantRecord::can_read)
                    .map(|g| g.secret_id),
            );
        }

        Ok(secrets)
    }
}
