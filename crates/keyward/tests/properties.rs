//! Property tests over grants, precedence and quorum counting, driven by the
//! testkit generators.

use std::collections::BTreeMap;

use proptest::prelude::*;

use keyward::core::{GrantKind, SymmetricKey};
use keyward::perms::{build_grant, evaluate, open_grant, GrantWrapping, SecretKeys};
use keyward::{
    AccessMode, GrantLevel, GroupVisibility, Precedence, Principal, RequestStatus, VaultConfig,
    Vote,
};
use keyward_testkit::generators::{
    grant_level, policy, precedence, principal, secret_id, secret_keypair, symmetric_key,
    vote_sequence,
};
use keyward_testkit::VaultFixture;

/// Tally the last vote each voter cast.
fn tally(votes: &[(usize, Vote)]) -> BTreeMap<usize, Vote> {
    votes.iter().copied().collect()
}

fn counts(final_votes: &BTreeMap<usize, Vote>) -> (u32, u32) {
    let approves = final_votes.values().filter(|v| **v == Vote::Approve).count() as u32;
    let blocks = final_votes.len() as u32 - approves;
    (approves, blocks)
}

/// The grant kind the resolver should settle on, if either holds one.
fn expected_winner(
    precedence: Precedence,
    user_level: GrantLevel,
    group_level: GrantLevel,
) -> Option<(GrantKind, GrantLevel)> {
    precedence
        .order()
        .into_iter()
        .map(|kind| match kind {
            GrantKind::User => (kind, user_level),
            GrantKind::Group => (kind, group_level),
        })
        .find(|(_, level)| *level != GrantLevel::None)
}

proptest! {
    #[test]
    fn prop_grant_opens_at_its_level(
        owner in principal(),
        secret in secret_id(),
        keypair in secret_keypair(),
        level in grant_level(),
        key in symmetric_key(),
        other in symmetric_key(),
    ) {
        prop_assume!(key != other);
        let keys = SecretKeys::full(&keypair);
        let grant = build_grant(owner, secret, &keys, level, &GrantWrapping::Key(key.clone()))
            .unwrap();

        match grant {
            None => prop_assert_eq!(level, GrantLevel::None),
            Some(grant) => {
                prop_assert_eq!(grant.principal, owner);
                let opened = open_grant(&grant, &key).unwrap();
                prop_assert_eq!(opened.level(), level);
                prop_assert_eq!(opened.read.to_bytes(), keys.read.to_bytes());
                prop_assert!(open_grant(&grant, &other).is_err());
            }
        }
    }

    #[test]
    fn prop_turning_a_block_into_an_approval_never_hurts(
        policy in policy(),
        votes in vote_sequence(5, 16),
    ) {
        let mut final_votes = tally(&votes);
        let (approves, blocks) = counts(&final_votes);
        let before = evaluate(&policy, approves, blocks);

        let blocker = final_votes
            .iter()
            .find(|(_, v)| **v == Vote::Block)
            .map(|(voter, _)| *voter);
        if let Some(voter) = blocker {
            final_votes.insert(voter, Vote::Approve);
            let (approves, blocks) = counts(&final_votes);
            let after = evaluate(&policy, approves, blocks);

            if before == RequestStatus::Granted {
                prop_assert_eq!(after, RequestStatus::Granted);
            }
            if before != RequestStatus::Blocked {
                prop_assert_ne!(after, RequestStatus::Blocked);
            }
        }
    }

    #[test]
    fn prop_no_votes_grant_only_a_lifted_approval_threshold(policy in policy()) {
        let status = evaluate(&policy, 0, 0);
        if policy.required_approvers == 0 {
            prop_assert_eq!(status, RequestStatus::Granted);
        } else {
            prop_assert_eq!(status, RequestStatus::Pending);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn prop_precedence_picks_the_first_kind_holding_a_grant(
        order in precedence(),
        user_level in grant_level(),
        group_level in grant_level(),
    ) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let mut f = VaultFixture::new().await;
            let (alice, _) = f.user("alice").await;
            let group = f.group("ops", &[alice]).await;
            let secret = f.secret("db", b"payload").await;
            f.vault
                .grant_access(&mut f.admin, &secret, Principal::User(alice), user_level)
                .await
                .unwrap();
            f.vault
                .grant_access(&mut f.admin, &secret, Principal::Group(group), group_level)
                .await
                .unwrap();

            let vault = f.vault_with(VaultConfig {
                precedence: order,
                ..VaultConfig::default()
            });
            let read = vault
                .resolve_access(&alice, &secret, AccessMode::Read, GroupVisibility::EnabledOnly)
                .await
                .unwrap();
            let modify = vault
                .resolve_access(&alice, &secret, AccessMode::Modify, GroupVisibility::EnabledOnly)
                .await
                .unwrap();

            match expected_winner(order, user_level, group_level) {
                None => {
                    assert!(read.is_none());
                    assert!(modify.is_none());
                }
                Some((kind, level)) => {
                    let via = match kind {
                        GrantKind::User => Principal::User(alice),
                        GrantKind::Group => Principal::Group(group),
                    };
                    assert_eq!(read.map(|r| r.via), Some(via));
                    let expected_modify = (level == GrantLevel::Modify).then_some(via);
                    assert_eq!(modify.map(|r| r.via), expected_modify);
                }
            }
        });
    }
}
