//! Access grant store.
//!
//! A grant wraps a secret's read-key and (optionally) modify-key under the
//! owning principal's symmetric key. The admin group's grant is escrow
//! wrapped so it can be written by any user, and it is never removed while
//! the secret exists.

use std::sync::Arc;

use tracing::debug;

use keyward_core::{
    EscrowPublicKey, GroupId, ModifyKey, Principal, ReadKey, SecretId, SecretKeypair,
    SecurityError, SymmetricKey, ValidationError, WrappedKey,
};
use keyward_store::{GrantRecord, Mutation, Store, StoreExt};

use crate::error::Result;
use crate::principal::Principals;
use crate::session::KeySession;

/// The level of access a grant carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GrantLevel {
    None,
    Read,
    Modify,
}

/// How a grant's halves are wrapped for their owner.
#[derive(Debug, Clone)]
pub enum GrantWrapping {
    /// Sealed under the owner's symmetric key.
    Key(SymmetricKey),
    /// Escrowed to the admin group.
    Escrow(EscrowPublicKey),
}

impl GrantWrapping {
    fn wrap(&self, material: &[u8]) -> std::result::Result<WrappedKey, SecurityError> {
        match self {
            GrantWrapping::Key(key) => WrappedKey::seal(material, key),
            GrantWrapping::Escrow(public) => WrappedKey::escrow(material, public),
        }
    }
}

/// A secret's unwrapped key halves, as far as a grant reaches.
#[derive(Debug, Clone)]
pub struct SecretKeys {
    pub read: ReadKey,
    pub modify: Option<ModifyKey>,
}

impl SecretKeys {
    /// Both halves of a freshly generated keypair.
    pub fn full(keypair: &SecretKeypair) -> Self {
        Self {
            read: keypair.read_key(),
            modify: Some(keypair.modify_key().clone()),
        }
    }

    /// The highest level these keys can grant onward.
    pub fn level(&self) -> GrantLevel {
        if self.modify.is_some() {
            GrantLevel::Modify
        } else {
            GrantLevel::Read
        }
    }
}

/// Build a grant record for `principal`.
///
/// Returns `None` for [`GrantLevel::None`]. Asking for modify without a
/// modify-key is a security fault.
pub fn build_grant(
    principal: Principal,
    secret_id: SecretId,
    keys: &SecretKeys,
    level: GrantLevel,
    wrapping: &GrantWrapping,
) -> Result<Option<GrantRecord>> {
    let modify_key = match level {
        GrantLevel::None => return Ok(None),
        GrantLevel::Read => None,
        GrantLevel::Modify => {
            let modify = keys.modify.as_ref().ok_or(SecurityError::MissingModifyKey)?;
            Some(wrapping.wrap(&modify.to_bytes()[..])?)
        }
    };

    Ok(Some(GrantRecord {
        principal,
        secret_id,
        read_key: Some(wrapping.wrap(&keys.read.to_bytes()[..])?),
        modify_key,
    }))
}

/// Unwrap a grant with its owner's key.
pub fn open_grant(grant: &GrantRecord, key: &SymmetricKey) -> Result<SecretKeys> {
    let wrapped_read = grant.read_key.as_ref().ok_or(SecurityError::MissingReadKey)?;
    let read = ReadKey::from_bytes(&wrapped_read.open(key)?)?;

    let modify = match &grant.modify_key {
        Some(wrapped) => Some(ModifyKey::from_bytes(&wrapped.open(key)?)?),
        None => None,
    };

    Ok(SecretKeys { read, modify })
}

/// Writes and removes grants.
pub struct Grants<S> {
    store: Arc<S>,
    principals: Arc<Principals<S>>,
}

impl<S: Store> Grants<S> {
    pub fn new(store: Arc<S>, principals: Arc<Principals<S>>) -> Self {
        Self { store, principals }
    }

    /// The wrapping to use for a principal's grant.
    ///
    /// The admin group is always escrowed. Other principals need their key
    /// in hand: the session's own key, a group key via membership, or admin
    /// recovery.
    pub async fn wrapping_for(
        &self,
        session: &mut KeySession,
        principal: &Principal,
    ) -> Result<GrantWrapping> {
        match principal {
            Principal::Group(id) if id.is_admin() => {
                Ok(GrantWrapping::Escrow(self.principals.escrow_public().await?))
            }
            Principal::Group(id) => {
                self.principals.live_group(id).await?;
                Ok(GrantWrapping::Key(self.principals.group_key(session, id).await?))
            }
            Principal::User(id) => {
                self.principals.live_user(id).await?;
                Ok(GrantWrapping::Key(
                    self.principals.user_key_for(session, id).await?,
                ))
            }
        }
    }

    /// The mutations that give a new secret its creator and admin grants.
    pub async fn creation_grants(
        &self,
        session: &KeySession,
        secret_id: SecretId,
        keys: &SecretKeys,
    ) -> Result<Vec<Mutation>> {
        let creator = Principal::User(session.user_id());
        let admin = Principal::Group(GroupId::ADMIN);
        let escrow = GrantWrapping::Escrow(self.principals.escrow_public().await?);
        let own = GrantWrapping::Key(session.user_key().clone());

        let mut batch = Vec::with_capacity(2);
        for (principal, wrapping) in [(creator, own), (admin, escrow)] {
            if let Some(grant) = build_grant(principal, secret_id, keys, GrantLevel::Modify, &wrapping)? {
                batch.push(Mutation::PutGrant(grant));
            }
        }
        Ok(batch)
    }

    /// Write or overwrite a principal's grant.
    ///
    /// `keys` are the actor's own unwrapped keys for the secret; they cap the
    /// level that can be granted. [`GrantLevel::None`] removes the grant.
    pub async fn grant_access(
        &self,
        session: &mut KeySession,
        keys: &SecretKeys,
        principal: Principal,
        secret_id: SecretId,
        level: GrantLevel,
    ) -> Result<()> {
        if level == GrantLevel::None {
            return self.revoke_access(&principal, &secret_id).await;
        }
        if level > keys.level() {
            return Err(SecurityError::MissingModifyKey.into());
        }
        if principal == Principal::Group(GroupId::ADMIN) && level != GrantLevel::Modify {
            return Err(ValidationError::Protected("admin group grant".into()).into());
        }

        let wrapping = self.wrapping_for(session, &principal).await?;
        if let Some(grant) = build_grant(principal, secret_id, keys, level, &wrapping)? {
            self.store.apply_one(Mutation::PutGrant(grant)).await?;
        }

        debug!(%principal, secret = %secret_id, ?level, "grant written");
        Ok(())
    }

    /// Remove one principal's grant.
    pub async fn revoke_access(&self, principal: &Principal, secret_id: &SecretId) -> Result<()> {
        if *principal == Principal::Group(GroupId::ADMIN) {
            return Err(ValidationError::Protected("admin group grant".into()).into());
        }

        self.store
            .apply_one(Mutation::DeleteGrant {
                principal: *principal,
                secret_id: *secret_id,
            })
            .await?;
        debug!(%principal, secret = %secret_id, "grant revoked");
        Ok(())
    }

    /// Remove every grant on a secret except the admin group's.
    pub async fn delete_all_grants(&self, secret_id: &SecretId) -> Result<()> {
        self.store
            .apply_one(Mutation::DeleteGrantsForSecret(*secret_id))
            .await?;
        debug!(secret = %secret_id, "all grants deleted");
        Ok(())
    }

    /// Every grant on a secret.
    pub async fn grants_for_secret(&self, secret_id: &SecretId) -> Result<Vec<GrantRecord>> {
        Ok(self.store.grants_for_secret(secret_id).await?)
    }
}
