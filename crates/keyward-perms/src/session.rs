//! Per-operation key context.
//!
//! A [`KeySession`] holds the unwrapped keys for one logical unit of work:
//! the acting user's key plus any group keys unwrapped along the way. It is
//! passed explicitly through calls and dropped (zeroizing its keys) when the
//! work is done. There is no process-wide key cache.

use std::collections::HashMap;

use keyward_core::{GroupId, Principal, SecurityError, SymmetricKey, UserId};

/// Unwrapped key material for one acting user.
#[derive(Debug)]
pub struct KeySession {
    user_id: UserId,
    user_key: SymmetricKey,
    group_keys: HashMap<GroupId, SymmetricKey>,
}

impl KeySession {
    /// Start a session for a user whose key has just been unwrapped.
    pub fn new(user_id: UserId, user_key: SymmetricKey) -> Self {
        Self {
            user_id,
            user_key,
            group_keys: HashMap::new(),
        }
    }

    /// The acting user.
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// The acting user's key.
    pub fn user_key(&self) -> &SymmetricKey {
        &self.user_key
    }

    /// A group key unwrapped earlier in this session.
    pub fn cached_group_key(&self, group_id: &GroupId) -> Option<&SymmetricKey> {
        self.group_keys.get(group_id)
    }

    /// Cache an unwrapped group key.
    pub fn remember_group(&mut self, group_id: GroupId, key: SymmetricKey) {
        self.group_keys.insert(group_id, key);
    }

    /// Drop a cached group key. Called when the user leaves the group.
    pub fn forget_group(&mut self, group_id: &GroupId) {
        self.group_keys.remove(group_id);
    }

    /// Drop every cached group key.
    pub fn forget_groups(&mut self) {
        self.group_keys.clear();
    }

    /// Swap in the user's new key after a rotation.
    ///
    /// Group keys stay valid: rotation only re-wraps them.
    pub fn replace_user_key(&mut self, key: SymmetricKey) {
        self.user_key = key;
    }

    /// The key this session holds for a principal, if any.
    pub fn key_for(&self, principal: &Principal) -> Result<&SymmetricKey, SecurityError> {
        match principal {
            Principal::User(id) if *id == self.user_id => Ok(&self.user_key),
            Principal::Group(id) => self
                .group_keys
                .get(id)
                .ok_or(SecurityError::KeyLocked(*principal)),
            _ => Err(SecurityError::KeyLocked(*principal)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_for_own_user() {
        let user = UserId::generate();
        let key = SymmetricKey::generate();
        let session = KeySession::new(user, key.clone());

        assert_eq!(session.key_for(&Principal::User(user)).unwrap(), &key);
        assert!(matches!(
            session.key_for(&Principal::User(UserId::generate())),
            Err(SecurityError::KeyLocked(_))
        ));
    }

    #[test]
    fn test_forget_group_invalidates_exactly_one() {
        let mut session = KeySession::new(UserId::generate(), SymmetricKey::generate());
        let g1 = GroupId::generate();
        let g2 = GroupId::generate();
        session.remember_group(g1, SymmetricKey::generate());
        session.remember_group(g2, SymmetricKey::generate());

        session.forget_group(&g1);
        assert!(session.cached_group_key(&g1).is_none());
        assert!(session.cached_group_key(&g2).is_some());
        assert!(session.key_for(&Principal::Group(g1)).is_err());
    }
}
