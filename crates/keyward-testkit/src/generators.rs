//! Proptest generators for property-based testing.

use proptest::prelude::*;

use keyward_core::{
    GroupId, Principal, SecretId, SecretKeypair, SymmetricKey, UserId,
};
use keyward_perms::{GrantLevel, Precedence, Vote};
use keyward_store::RestrictedAccessPolicy;

/// Generate a random symmetric key.
pub fn symmetric_key() -> impl Strategy<Value = SymmetricKey> {
    any::<[u8; 32]>().prop_map(SymmetricKey::from_bytes)
}

/// Generate a fresh secret keypair.
///
/// Keypairs draw from the OS RNG, so shrinking does not reproduce them.
pub fn secret_keypair() -> impl Strategy<Value = SecretKeypair> {
    Just(()).prop_map(|_| SecretKeypair::generate())
}

/// Generate a random SecretId.
pub fn secret_id() -> impl Strategy<Value = SecretId> {
    any::<[u8; 16]>().prop_map(SecretId::from_bytes)
}

/// Generate a random UserId, never the no-user sentinel.
pub fn user_id() -> impl Strategy<Value = UserId> {
    any::<[u8; 16]>()
        .prop_filter("sentinel", |b| *b != [0xff; 16])
        .prop_map(UserId::from_bytes)
}

/// Generate a random GroupId, never the admin group.
pub fn group_id() -> impl Strategy<Value = GroupId> {
    any::<[u8; 16]>()
        .prop_filter("admin group", |b| *b != [0; 16])
        .prop_map(GroupId::from_bytes)
}

/// Generate a user or group principal.
pub fn principal() -> impl Strategy<Value = Principal> {
    prop_oneof![
        user_id().prop_map(Principal::User),
        group_id().prop_map(Principal::Group),
    ]
}

/// Generate payload bytes of specified max length.
pub fn payload(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=max_len)
}

/// Generate a restricted-access policy with small thresholds.
pub fn policy() -> impl Strategy<Value = RestrictedAccessPolicy> {
    (0u32..5, 0u32..5).prop_map(|(required_approvers, required_blockers)| {
        RestrictedAccessPolicy {
            required_approvers,
            required_blockers,
        }
    })
}

/// Generate a vote.
pub fn vote() -> impl Strategy<Value = Vote> {
    prop_oneof![Just(Vote::Approve), Just(Vote::Block)]
}

/// Generate a sequence of (voter index, vote) pairs over `voters` voters.
pub fn vote_sequence(voters: usize, max_len: usize) -> impl Strategy<Value = Vec<(usize, Vote)>> {
    prop::collection::vec((0..voters.max(1), vote()), 0..=max_len)
}

/// Generate a grant level.
pub fn grant_level() -> impl Strategy<Value = GrantLevel> {
    prop_oneof![
        Just(GrantLevel::None),
        Just(GrantLevel::Read),
        Just(GrantLevel::Modify),
    ]
}

/// Generate a precedence mode.
pub fn precedence() -> impl Strategy<Value = Precedence> {
    prop_oneof![Just(Precedence::UserFirst), Just(Precedence::GroupFirst)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyward_core::{open, seal};

    proptest! {
        #[test]
        fn prop_generated_ids_avoid_reserved(user in user_id(), group in group_id()) {
            prop_assert_ne!(user, UserId::NONE);
            prop_assert!(!group.is_admin());
        }

        #[test]
        fn prop_generated_keypairs_seal(keypair in secret_keypair(), data in payload(256)) {
            let blob = seal(&data, Some(keypair.modify_key())).unwrap();
            prop_assert_eq!(open(&blob, Some(&keypair.read_key())).unwrap(), data);
        }
    }
}
