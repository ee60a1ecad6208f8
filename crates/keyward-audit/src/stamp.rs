//! Tamperstamps.
//!
//! An entry's hash covers its time, event text, secret and user. The stamp
//! is that hash keyed with a key derived from the acting user's symmetric
//! key, so only someone holding that user's key can produce or check it.
//! Entries without an acting user carry the bare hash.

use keyward_core::{SecretId, SymmetricKey, UserId};
use keyward_store::AuditRecord;

const STAMP_CONTEXT: &str = "keyward 2024 audit stamp v1";

/// Result of validating an entry's stamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditVerdict {
    Valid,
    Invalid,
    /// No stamp, no acting user, or no key to check with.
    Unknown,
}

/// Hash the stamped fields of an entry.
pub fn entry_hash(
    time: i64,
    event: &str,
    secret_id: Option<&SecretId>,
    user_id: &UserId,
) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&time.to_le_bytes());
    hasher.update(&(event.len() as u64).to_le_bytes());
    hasher.update(event.as_bytes());
    match secret_id {
        Some(id) => {
            hasher.update(&[1]);
            hasher.update(id.as_bytes());
        }
        None => {
            hasher.update(&[0]);
        }
    }
    hasher.update(user_id.as_bytes());
    hasher.finalize()
}

/// Hash of a stored record.
pub fn record_hash(record: &AuditRecord) -> blake3::Hash {
    entry_hash(
        record.time,
        &record.event,
        record.secret_id.as_ref(),
        &record.user_id,
    )
}

/// Bind a hash to a user's key.
pub fn user_stamp(hash: &blake3::Hash, user_key: &SymmetricKey) -> blake3::Hash {
    user_key.derive(STAMP_CONTEXT).keyed_hash(hash.as_bytes())
}

/// Check a record's stamp against a candidate user key.
pub fn verify(record: &AuditRecord, candidate_key: Option<&SymmetricKey>) -> AuditVerdict {
    let (stamp, key) = match (&record.stamp, record.acting_user(), candidate_key) {
        (Some(stamp), Some(_), Some(key)) => (stamp, key),
        _ => return AuditVerdict::Unknown,
    };

    let stored: [u8; blake3::OUT_LEN] = match stamp.as_slice().try_into() {
        Ok(bytes) => bytes,
        Err(_) => return AuditVerdict::Invalid,
    };

    // blake3::Hash equality is constant time.
    if blake3::Hash::from(stored) == user_stamp(&record_hash(record), key) {
        AuditVerdict::Valid
    } else {
        AuditVerdict::Invalid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(user_id: UserId, key: Option<&SymmetricKey>) -> AuditRecord {
        let secret_id = SecretId::generate();
        let hash = entry_hash(42, "opened secret", Some(&secret_id), &user_id);
        let stamp = match key {
            Some(key) => user_stamp(&hash, key),
            None => hash,
        };
        AuditRecord {
            id: 1,
            time: 42,
            secret_id: Some(secret_id),
            user_id,
            event: "opened secret".into(),
            stamp: Some(stamp.as_bytes().to_vec()),
        }
    }

    #[test]
    fn test_valid_with_own_key() {
        let key = SymmetricKey::generate();
        let r = record(UserId::generate(), Some(&key));
        assert_eq!(verify(&r, Some(&key)), AuditVerdict::Valid);
    }

    #[test]
    fn test_other_key_or_edit_is_invalid() {
        let key = SymmetricKey::generate();
        let mut r = record(UserId::generate(), Some(&key));
        assert_eq!(
            verify(&r, Some(&SymmetricKey::generate())),
            AuditVerdict::Invalid
        );

        r.event.push('!');
        assert_eq!(verify(&r, Some(&key)), AuditVerdict::Invalid);
    }

    #[test]
    fn test_unknown_cases() {
        let key = SymmetricKey::generate();
        let anonymous = record(UserId::NONE, None);
        assert_eq!(verify(&anonymous, Some(&key)), AuditVerdict::Unknown);

        let mut unstamped = record(UserId::generate(), Some(&key));
        unstamped.stamp = None;
        assert_eq!(verify(&unstamped, Some(&key)), AuditVerdict::Unknown);

        let stamped = record(UserId::generate(), Some(&key));
        assert_eq!(verify(&stamped, None), AuditVerdict::Unknown);
    }

    #[test]
    fn test_hash_separates_fields() {
        let user = UserId::generate();
        assert_ne!(
            entry_hash(1, "a", None, &user),
            entry_hash(1, "a", Some(&SecretId::from_bytes([0; 16])), &user)
        );
        assert_ne!(entry_hash(1, "a", None, &user), entry_hash(2, "a", None, &user));
    }

    proptest::proptest! {
        #[test]
        fn prop_any_event_edit_is_caught(
            event in "[a-z ]{1,40}",
            suffix in "[a-z]{1,8}",
            time in proptest::prelude::any::<i64>(),
        ) {
            let key = SymmetricKey::generate();
            let user_id = UserId::generate();
            let stamp = user_stamp(&entry_hash(time, &event, None, &user_id), &key);
            let mut r = AuditRecord {
                id: 7,
                time,
                secret_id: None,
                user_id,
                event: event.clone(),
                stamp: Some(stamp.as_bytes().to_vec()),
            };
            proptest::prop_assert_eq!(verify(&r, Some(&key)), AuditVerdict::Valid);

            r.event = format!("{}{}", event, suffix);
            proptest::prop_assert_eq!(verify(&r, Some(&key)), AuditVerdict::Invalid);
        }
    }
}
