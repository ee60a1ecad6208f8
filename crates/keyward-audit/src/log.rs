//! The append-only audit log.

use std::sync::Arc;

use tracing::{debug, warn};

use keyward_core::{unwrap_principal_key, SecretId, SymmetricKey, UserId};
use keyward_store::{AuditFilter, AuditRecord, PrincipalStatus, Store, UserRecord};

use crate::error::{AuditError, Result};
use crate::notifier::Notifier;
use crate::stamp::{entry_hash, user_stamp, verify, AuditVerdict};

/// Who caused an audited event.
#[derive(Debug, Clone, Copy)]
pub enum Actor<'a> {
    /// No user acted. Stamps carry the bare hash.
    Nobody,
    /// A known user whose key is not unlocked (a failed login, say).
    /// Such entries are never stamped.
    Unkeyed(UserId),
    /// A user acting with their unlocked key.
    Keyed {
        user_id: UserId,
        key: &'a SymmetricKey,
    },
}

impl Actor<'_> {
    fn user_id(&self) -> UserId {
        match self {
            Actor::Nobody => UserId::NONE,
            Actor::Unkeyed(id) | Actor::Keyed { user_id: id, .. } => *id,
        }
    }
}

/// Writes, reads and validates audit entries.
pub struct AuditLog<S> {
    store: Arc<S>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl<S: Store> AuditLog<S> {
    /// A log without notification.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            notifier: None,
        }
    }

    /// Forward every entry to `notifier` after it is written.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Append an entry and return its id.
    ///
    /// Notification happens after the write. If it fails, a stampless
    /// no-user entry describing the failure is appended and the original
    /// append still succeeds.
    pub async fn append(
        &self,
        actor: Actor<'_>,
        secret_id: Option<SecretId>,
        event: &str,
        stamp_requested: bool,
        now: i64,
    ) -> Result<u64> {
        let user_id = actor.user_id();
        let stamp = if stamp_requested {
            let hash = entry_hash(now, event, secret_id.as_ref(), &user_id);
            match actor {
                Actor::Nobody => Some(hash.as_bytes().to_vec()),
                Actor::Unkeyed(_) => None,
                Actor::Keyed { key, .. } => Some(user_stamp(&hash, key).as_bytes().to_vec()),
            }
        } else {
            None
        };

        let mut record = AuditRecord {
            id: 0,
            time: now,
            secret_id,
            user_id,
            event: event.to_string(),
            stamp,
        };
        record.id = self.store.append_audit(&record).await?;
        debug!(entry = record.id, event, "audit entry appended");

        if let Some(notifier) = &self.notifier {
            if let Err(e) = notifier.notify(&record).await {
                warn!(entry = record.id, error = %e, "audit notification failed");
                let degraded = AuditRecord {
                    id: 0,
                    time: now,
                    secret_id: None,
                    user_id: UserId::NONE,
                    event: format!("Unable to send audit notification (reason: {})", e),
                    stamp: None,
                };
                if let Err(e) = self.store.append_audit(&degraded).await {
                    warn!(error = %e, "could not record notification failure");
                }
            }
        }

        Ok(record.id)
    }

    /// Get an entry by id.
    pub async fn entry(&self, id: u64) -> Result<AuditRecord> {
        self.store
            .get_audit(id)
            .await?
            .ok_or(AuditError::NotFound(id))
    }

    /// Check an entry's stamp with a candidate user's key.
    ///
    /// Entries stamped before the acting user's last key rotation are
    /// [`AuditVerdict::Unknown`]: the key that made them is gone.
    pub async fn validate(&self, id: u64, candidate_key: &SymmetricKey) -> Result<AuditVerdict> {
        let record = self.entry(id).await?;
        if let Some(user_id) = record.acting_user() {
            if let Some(user) = self.store.get_user(&user_id).await? {
                if stamped_before_rotation(&record, &user) {
                    return Ok(AuditVerdict::Unknown);
                }
            }
        }
        Ok(verify(&record, Some(candidate_key)))
    }

    /// Check an entry's stamp by recovering the acting user's key through
    /// the admin escrow.
    ///
    /// Entries by deleted or unknown users, and entries stamped before the
    /// user's last key rotation, are [`AuditVerdict::Unknown`].
    pub async fn validate_as_admin(&self, id: u64, admin_key: &SymmetricKey) -> Result<AuditVerdict> {
        let record = self.entry(id).await?;
        let user_id = match record.acting_user() {
            Some(id) => id,
            None => return Ok(AuditVerdict::Unknown),
        };

        let user = match self.store.get_user(&user_id).await? {
            Some(user) if user.status != PrincipalStatus::Deleted => user,
            _ => return Ok(AuditVerdict::Unknown),
        };
        if stamped_before_rotation(&record, &user) {
            debug!(entry = id, user = %user_id, "entry predates key rotation");
            return Ok(AuditVerdict::Unknown);
        }

        let user_key = unwrap_principal_key(&user.key_by_admin, admin_key)?;
        Ok(verify(&record, Some(&user_key)))
    }

    /// Entries with `start <= time <= end` passing the filter, oldest first.
    pub async fn entries_between(
        &self,
        start: i64,
        end: i64,
        filter: &AuditFilter,
    ) -> Result<Vec<AuditRecord>> {
        Ok(self.store.audit_between(start, end, filter).await?)
    }
}

/// Whether the entry's stamp was keyed with a key the user has since
/// replaced. Rotation and entry times share one clock, so an entry in the
/// rotation's own millisecond counts as before it.
fn stamped_before_rotation(record: &AuditRecord, user: &UserRecord) -> bool {
    record.stamp.is_some() && user.key_rotated_at.map_or(false, |at| record.time <= at)
}
