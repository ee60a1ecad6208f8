//! SQLite implementation of the Store trait.
//!
//! This is the primary storage backend. It uses rusqlite with bundled
//! SQLite, wrapped in async via tokio::spawn_blocking.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use keyward_core::{
    ApproverListId, EscrowPublicKey, GrantKind, GroupId, Principal, RequestId, SecretId, UserId,
    WrappedKey,
};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::records::{
    ApproverEntry, ApproverRole, ApproverState, AuditFilter, AuditRecord, GrantRecord,
    GroupRecord, MembershipRecord, Mutation, PrincipalStatus, RaRequestRecord,
    RestrictedAccessPolicy, SecretRecord, UserRecord, VaultMeta,
};
use crate::traits::Store;

const USER_COLUMNS: &str =
    "user_id, name, login_salt, key_by_login, key_by_admin, status, failed_logins, key_rotated_at";
const GROUP_COLUMNS: &str = "group_id, name, status, key_by_admin";
const MEMBERSHIP_COLUMNS: &str = "user_id, group_id, group_key";
const GRANT_COLUMNS: &str = "kind, principal_id, secret_id, read_key, modify_key";
const SECRET_COLUMNS: &str =
    "secret_id, name, payload, created_at, updated_at, required_approvers, required_blockers";
const REQUEST_COLUMNS: &str = "request_id, secret_id, requester_id, approver_list_id, \
     request_time, viewed_time, reason, lifetime_ms";
const AUDIT_COLUMNS: &str = "entry_id, time, secret_id, user_id, event, stamp";

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a blocking operation on the connection off the async runtime.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::Unavailable(format!("mutex poisoned: {}", e)))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("spawn_blocking failed: {}", e)))?
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Column helpers
// ─────────────────────────────────────────────────────────────────────────────

fn invalid_column(idx: usize, what: String) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(idx, what, Type::Blob)
}

fn id_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<[u8; 16]> {
    let bytes: Vec<u8> = row.get(idx)?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| invalid_column(idx, format!("expected 16 bytes, got {}", b.len())))
}

fn optional_id_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<[u8; 16]>> {
    let bytes: Option<Vec<u8>> = row.get(idx)?;
    bytes
        .map(|b| {
            b.try_into().map_err(|b: Vec<u8>| {
                invalid_column(idx, format!("expected 16 bytes, got {}", b.len()))
            })
        })
        .transpose()
}

fn wrapped_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<WrappedKey> {
    let bytes: Vec<u8> = row.get(idx)?;
    WrappedKey::from_bytes(&bytes)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Blob, Box::new(e)))
}

fn optional_wrapped_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<WrappedKey>> {
    let bytes: Option<Vec<u8>> = row.get(idx)?;
    bytes
        .map(|b| {
            WrappedKey::from_bytes(&b).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(idx, Type::Blob, Box::new(e))
            })
        })
        .transpose()
}

fn status_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<PrincipalStatus> {
    let value: u8 = row.get(idx)?;
    PrincipalStatus::from_u8(value)
        .ok_or_else(|| invalid_column(idx, format!("unknown status {}", value)))
}

fn principal_from(kind: u8, id: [u8; 16], idx: usize) -> rusqlite::Result<Principal> {
    match GrantKind::from_u8(kind) {
        Some(GrantKind::User) => Ok(Principal::User(UserId::from_bytes(id))),
        Some(GrantKind::Group) => Ok(Principal::Group(GroupId::from_bytes(id))),
        None => Err(invalid_column(idx, format!("unknown principal kind {}", kind))),
    }
}

fn encode_wrapped(wrapped: &WrappedKey) -> Result<Vec<u8>> {
    wrapped
        .to_bytes()
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn encode_optional(wrapped: Option<&WrappedKey>) -> Result<Option<Vec<u8>>> {
    wrapped.map(encode_wrapped).transpose()
}

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        id: UserId::from_bytes(id_column(row, 0)?),
        name: row.get(1)?,
        login_salt: id_column(row, 2)?,
        key_by_login: wrapped_column(row, 3)?,
        key_by_admin: wrapped_column(row, 4)?,
        status: status_column(row, 5)?,
        failed_logins: row.get(6)?,
        key_rotated_at: row.get(7)?,
    })
}

fn row_to_group(row: &Row<'_>) -> rusqlite::Result<GroupRecord> {
    Ok(GroupRecord {
        id: GroupId::from_bytes(id_column(row, 0)?),
        name: row.get(1)?,
        status: status_column(row, 2)?,
        key_by_admin: optional_wrapped_column(row, 3)?,
    })
}

fn row_to_membership(row: &Row<'_>) -> rusqlite::Result<MembershipRecord> {
    Ok(MembershipRecord {
        user_id: UserId::from_bytes(id_column(row, 0)?),
        group_id: GroupId::from_bytes(id_column(row, 1)?),
        group_key: optional_wrapped_column(row, 2)?,
    })
}

fn row_to_grant(row: &Row<'_>) -> rusqlite::Result<GrantRecord> {
    let kind: u8 = row.get(0)?;
    Ok(GrantRecord {
        principal: principal_from(kind, id_column(row, 1)?, 0)?,
        secret_id: SecretId::from_bytes(id_column(row, 2)?),
        read_key: optional_wrapped_column(row, 3)?,
        modify_key: optional_wrapped_column(row, 4)?,
    })
}

fn row_to_secret(row: &Row<'_>) -> rusqlite::Result<SecretRecord> {
    let required_approvers: Option<u32> = row.get(5)?;
    let required_blockers: Option<u32> = row.get(6)?;
    let restricted = match (required_approvers, required_blockers) {
        (Some(required_approvers), Some(required_blockers)) => Some(RestrictedAccessPolicy {
            required_approvers,
            required_blockers,
        }),
        _ => None,
    };

    Ok(SecretRecord {
        id: SecretId::from_bytes(id_column(row, 0)?),
        name: row.get(1)?,
        payload: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
        restricted,
    })
}

fn row_to_request(row: &Row<'_>) -> rusqlite::Result<RaRequestRecord> {
    Ok(RaRequestRecord {
        id: RequestId::from_bytes(id_column(row, 0)?),
        secret_id: SecretId::from_bytes(id_column(row, 1)?),
        requester: UserId::from_bytes(id_column(row, 2)?),
        approver_list: ApproverListId::from_bytes(id_column(row, 3)?),
        request_time: row.get(4)?,
        viewed_time: row.get(5)?,
        reason: row.get(6)?,
        lifetime_ms: row.get(7)?,
    })
}

fn row_to_audit(row: &Row<'_>) -> rusqlite::Result<AuditRecord> {
    let id: i64 = row.get(0)?;
    Ok(AuditRecord {
        id: id as u64,
        time: row.get(1)?,
        secret_id: optional_id_column(row, 2)?.map(SecretId::from_bytes),
        user_id: UserId::from_bytes(id_column(row, 3)?),
        event: row.get(4)?,
        stamp: row.get(5)?,
    })
}

fn exists(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<bool> {
    Ok(conn.query_row(sql, params, |_| Ok(()))
        .optional()?
        .is_some())
}

// ─────────────────────────────────────────────────────────────────────────────
// Batch application
// ─────────────────────────────────────────────────────────────────────────────

fn apply_mutation(conn: &Connection, mutation: Mutation) -> Result<()> {
    match mutation {
        Mutation::PutMeta(meta) => {
            conn.execute(
                "INSERT INTO vault_meta (singleton, escrow_public, bootstrapped_at)
                 VALUES (1, ?1, ?2)
                 ON CONFLICT(singleton) DO UPDATE SET
                    escrow_public = excluded.escrow_public,
                    bootstrapped_at = excluded.bootstrapped_at",
                params![meta.escrow_public.as_bytes().as_slice(), meta.bootstrapped_at],
            )?;
        }
        Mutation::InsertUser(user) => {
            if exists(
                conn,
                "SELECT 1 FROM principal_user WHERE user_id = ?1",
                params![user.id.as_bytes().as_slice()],
            )? {
                return Err(StoreError::Conflict(format!("user {}", user.id)));
            }
            check_user_name_free(conn, &user)?;
            conn.execute(
                &format!(
                    "INSERT INTO principal_user ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    USER_COLUMNS
                ),
                params![
                    user.id.as_bytes().as_slice(),
                    user.name,
                    user.login_salt.as_slice(),
                    encode_wrapped(&user.key_by_login)?,
                    encode_wrapped(&user.key_by_admin)?,
                    user.status as u8,
                    user.failed_logins,
                    user.key_rotated_at,
                ],
            )?;
        }
        Mutation::SetUserKeys {
            user_id,
            expected_login,
            login_salt,
            key_by_login,
            key_by_admin,
            rotated_at,
        } => {
            let changed = conn.execute(
                "UPDATE principal_user SET login_salt = ?2, key_by_login = ?3, key_by_admin = ?4,
                    key_rotated_at = COALESCE(?5, key_rotated_at)
                 WHERE user_id = ?1 AND status != ?6 AND key_by_login = ?7",
                params![
                    user_id.as_bytes().as_slice(),
                    login_salt.as_slice(),
                    encode_wrapped(&key_by_login)?,
                    encode_wrapped(&key_by_admin)?,
                    rotated_at,
                    PrincipalStatus::Deleted as u8,
                    encode_wrapped(&expected_login)?,
                ],
            )?;
            if changed == 0 {
                live_user_exists(conn, &user_id)?;
                return Err(StoreError::Conflict(format!("keys of user {}", user_id)));
            }
        }
        Mutation::SetUserStatus { user_id, status } => {
            let changed = conn.execute(
                "UPDATE principal_user SET status = ?2,
                    failed_logins = CASE WHEN ?2 = ?3 THEN 0 ELSE failed_logins END
                 WHERE user_id = ?1 AND status != ?4",
                params![
                    user_id.as_bytes().as_slice(),
                    status as u8,
                    PrincipalStatus::Enabled as u8,
                    PrincipalStatus::Deleted as u8,
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("user {}", user_id)));
            }
        }
        Mutation::RecordFailedLogin { user_id, threshold } => {
            let changed = conn.execute(
                "UPDATE principal_user SET failed_logins = failed_logins + 1,
                    status = CASE
                        WHEN ?2 > 0 AND failed_logins + 1 >= ?2 AND status = ?3 THEN ?4
                        ELSE status
                    END
                 WHERE user_id = ?1 AND status != ?5",
                params![
                    user_id.as_bytes().as_slice(),
                    threshold,
                    PrincipalStatus::Enabled as u8,
                    PrincipalStatus::Disabled as u8,
                    PrincipalStatus::Deleted as u8,
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("user {}", user_id)));
            }
        }
        Mutation::ResetFailedLogins(user_id) => {
            let changed = conn.execute(
                "UPDATE principal_user SET failed_logins = 0 WHERE user_id = ?1 AND status != ?2",
                params![user_id.as_bytes().as_slice(), PrincipalStatus::Deleted as u8],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("user {}", user_id)));
            }
        }
        Mutation::InsertGroup(group) => {
            if exists(
                conn,
                "SELECT 1 FROM principal_group WHERE group_id = ?1",
                params![group.id.as_bytes().as_slice()],
            )? {
                return Err(StoreError::Conflict(format!("group {}", group.id)));
            }
            conn.execute(
                &format!("INSERT INTO principal_group ({}) VALUES (?1, ?2, ?3, ?4)", GROUP_COLUMNS),
                params![
                    group.id.as_bytes().as_slice(),
                    group.name,
                    group.status as u8,
                    encode_optional(group.key_by_admin.as_ref())?,
                ],
            )?;
        }
        Mutation::UpdateGroup(group) => {
            let changed = conn.execute(
                "UPDATE principal_group SET name = ?2, status = ?3, key_by_admin = ?4
                 WHERE group_id = ?1",
                params![
                    group.id.as_bytes().as_slice(),
                    group.name,
                    group.status as u8,
                    encode_optional(group.key_by_admin.as_ref())?,
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("group {}", group.id)));
            }
        }
        Mutation::PutMembership(membership) => {
            if !exists(
                conn,
                "SELECT 1 FROM principal_user WHERE user_id = ?1",
                params![membership.user_id.as_bytes().as_slice()],
            )? {
                return Err(StoreError::NotFound(format!("user {}", membership.user_id)));
            }
            if !exists(
                conn,
                "SELECT 1 FROM principal_group WHERE group_id = ?1",
                params![membership.group_id.as_bytes().as_slice()],
            )? {
                return Err(StoreError::NotFound(format!("group {}", membership.group_id)));
            }
            conn.execute(
                "INSERT INTO membership (user_id, group_id, group_key) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id, group_id) DO UPDATE SET group_key = excluded.group_key",
                params![
                    membership.user_id.as_bytes().as_slice(),
                    membership.group_id.as_bytes().as_slice(),
                    encode_optional(membership.group_key.as_ref())?,
                ],
            )?;
        }
        Mutation::DeleteMembership { user_id, group_id } => {
            conn.execute(
                "DELETE FROM membership WHERE user_id = ?1 AND group_id = ?2",
                params![user_id.as_bytes().as_slice(), group_id.as_bytes().as_slice()],
            )?;
        }
        Mutation::RewrapMembership {
            expected,
            group_key,
        } => {
            let changed = conn.execute(
                "UPDATE membership SET group_key = ?3
                 WHERE user_id = ?1 AND group_id = ?2 AND group_key IS ?4",
                params![
                    expected.user_id.as_bytes().as_slice(),
                    expected.group_id.as_bytes().as_slice(),
                    encode_optional(group_key.as_ref())?,
                    encode_optional(expected.group_key.as_ref())?,
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::Conflict(format!(
                    "membership of user {} in group {}",
                    expected.user_id, expected.group_id
                )));
            }
        }
        Mutation::ExpectMemberships { user_id, group_ids } => {
            let held = query_all(
                conn,
                "SELECT group_id FROM membership WHERE user_id = ?1",
                params![user_id.as_bytes().as_slice()],
                |row| id_column(row, 0),
            )?;
            if !same_ids(held, group_ids.iter().map(|g| *g.as_bytes())) {
                return Err(StoreError::Conflict(format!("memberships of user {}", user_id)));
            }
        }
        Mutation::PutGrant(grant) => {
            if !exists(
                conn,
                "SELECT 1 FROM secret WHERE secret_id = ?1",
                params![grant.secret_id.as_bytes().as_slice()],
            )? {
                return Err(StoreError::NotFound(format!("secret {}", grant.secret_id)));
            }
            conn.execute(
                "INSERT INTO access_grant (kind, principal_id, secret_id, read_key, modify_key)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(kind, principal_id, secret_id) DO UPDATE SET
                    read_key = excluded.read_key,
                    modify_key = excluded.modify_key",
                params![
                    grant.kind() as u8,
                    grant.principal.id_bytes().as_slice(),
                    grant.secret_id.as_bytes().as_slice(),
                    encode_optional(grant.read_key.as_ref())?,
                    encode_optional(grant.modify_key.as_ref())?,
                ],
            )?;
        }
        Mutation::DeleteGrant {
            principal,
            secret_id,
        } => {
            conn.execute(
                "DELETE FROM access_grant WHERE kind = ?1 AND principal_id = ?2 AND secret_id = ?3",
                params![
                    principal.kind() as u8,
                    principal.id_bytes().as_slice(),
                    secret_id.as_bytes().as_slice(),
                ],
            )?;
        }
        Mutation::RewrapGrant {
            expected,
            read_key,
            modify_key,
        } => {
            let changed = conn.execute(
                "UPDATE access_grant SET read_key = ?4, modify_key = ?5
                 WHERE kind = ?1 AND principal_id = ?2 AND secret_id = ?3
                    AND read_key IS ?6 AND modify_key IS ?7",
                params![
                    expected.kind() as u8,
                    expected.principal.id_bytes().as_slice(),
                    expected.secret_id.as_bytes().as_slice(),
                    encode_optional(read_key.as_ref())?,
                    encode_optional(modify_key.as_ref())?,
                    encode_optional(expected.read_key.as_ref())?,
                    encode_optional(expected.modify_key.as_ref())?,
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::Conflict(format!(
                    "grant of {} on secret {}",
                    expected.principal, expected.secret_id
                )));
            }
        }
        Mutation::ExpectGrants {
            principal,
            secret_ids,
        } => {
            let held = query_all(
                conn,
                "SELECT secret_id FROM access_grant WHERE kind = ?1 AND principal_id = ?2",
                params![principal.kind() as u8, principal.id_bytes().as_slice()],
                |row| id_column(row, 0),
            )?;
            if !same_ids(held, secret_ids.iter().map(|s| *s.as_bytes())) {
                return Err(StoreError::Conflict(format!("grants of {}", principal)));
            }
        }
        Mutation::DeleteGrantsForSecret(secret_id) => {
            conn.execute(
                "DELETE FROM access_grant
                 WHERE secret_id = ?1 AND NOT (kind = ?2 AND principal_id = ?3)",
                params![
                    secret_id.as_bytes().as_slice(),
                    GrantKind::Group as u8,
                    GroupId::ADMIN.as_bytes().as_slice(),
                ],
            )?;
        }
        Mutation::PutSecret(secret) => {
            let (approvers, blockers) = match secret.restricted {
                Some(policy) => (
                    Some(policy.required_approvers),
                    Some(policy.required_blockers),
                ),
                None => (None, None),
            };
            conn.execute(
                &format!(
                    "INSERT INTO secret ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(secret_id) DO UPDATE SET
                        name = excluded.name,
                        payload = excluded.payload,
                        updated_at = excluded.updated_at,
                        required_approvers = excluded.required_approvers,
                        required_blockers = excluded.required_blockers",
                    SECRET_COLUMNS
                ),
                params![
                    secret.id.as_bytes().as_slice(),
                    secret.name,
                    secret.payload,
                    secret.created_at,
                    secret.updated_at,
                    approvers,
                    blockers,
                ],
            )?;
        }
        Mutation::DeleteSecret(secret_id) => {
            let id = secret_id.as_bytes().as_slice();
            conn.execute("DELETE FROM access_grant WHERE secret_id = ?1", params![id])?;
            conn.execute("DELETE FROM approver_role WHERE secret_id = ?1", params![id])?;
            conn.execute("DELETE FROM secret WHERE secret_id = ?1", params![id])?;
        }
        Mutation::PutApproverRole(role) => {
            conn.execute(
                "INSERT OR IGNORE INTO approver_role (secret_id, kind, principal_id)
                 VALUES (?1, ?2, ?3)",
                params![
                    role.secret_id.as_bytes().as_slice(),
                    role.principal.kind() as u8,
                    role.principal.id_bytes().as_slice(),
                ],
            )?;
        }
        Mutation::DeleteApproverRole(role) => {
            conn.execute(
                "DELETE FROM approver_role WHERE secret_id = ?1 AND kind = ?2 AND principal_id = ?3",
                params![
                    role.secret_id.as_bytes().as_slice(),
                    role.principal.kind() as u8,
                    role.principal.id_bytes().as_slice(),
                ],
            )?;
        }
    }
    Ok(())
}

fn insert_request(conn: &Connection, request: &RaRequestRecord, approvers: &[UserId]) -> Result<()> {
    if exists(
        conn,
        "SELECT 1 FROM ra_request WHERE request_id = ?1",
        params![request.id.as_bytes().as_slice()],
    )? {
        return Err(StoreError::Conflict(format!("request {}", request.id)));
    }
    conn.execute(
        &format!(
            "INSERT INTO ra_request ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            REQUEST_COLUMNS
        ),
        params![
            request.id.as_bytes().as_slice(),
            request.secret_id.as_bytes().as_slice(),
            request.requester.as_bytes().as_slice(),
            request.approver_list.as_bytes().as_slice(),
            request.request_time,
            request.viewed_time,
            request.reason,
            request.lifetime_ms,
        ],
    )?;

    let mut stmt = conn
        .prepare("INSERT INTO ra_approver_list (list_id, user_id, state) VALUES (?1, ?2, ?3)")?;
    for user_id in approvers {
        stmt.execute(params![
            request.approver_list.as_bytes().as_slice(),
            user_id.as_bytes().as_slice(),
            ApproverState::Unset as u8,
        ])?;
    }
    Ok(())
}

fn latest_request(
    conn: &Connection,
    secret_id: &SecretId,
    requester: &UserId,
) -> Result<Option<RaRequestRecord>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM ra_request WHERE secret_id = ?1 AND requester_id = ?2
             ORDER BY request_time DESC LIMIT 1",
            REQUEST_COLUMNS
        ),
        params![
            secret_id.as_bytes().as_slice(),
            requester.as_bytes().as_slice()
        ],
        row_to_request,
    )
    .optional()
    .map_err(StoreError::from)
}

/// Not-found unless the user exists and is not deleted.
fn live_user_exists(conn: &Connection, user_id: &UserId) -> Result<()> {
    if exists(
        conn,
        "SELECT 1 FROM principal_user WHERE user_id = ?1 AND status != ?2",
        params![user_id.as_bytes().as_slice(), PrincipalStatus::Deleted as u8],
    )? {
        Ok(())
    } else {
        Err(StoreError::NotFound(format!("user {}", user_id)))
    }
}

/// Whether two id lists hold the same set.
fn same_ids(mut held: Vec<[u8; 16]>, expected: impl Iterator<Item = [u8; 16]>) -> bool {
    let mut expected: Vec<[u8; 16]> = expected.collect();
    held.sort_unstable();
    expected.sort_unstable();
    held == expected
}

fn check_user_name_free(conn: &Connection, user: &UserRecord) -> Result<()> {
    if exists(
        conn,
        "SELECT 1 FROM principal_user WHERE name = ?1 AND user_id != ?2",
        params![user.name, user.id.as_bytes().as_slice()],
    )? {
        return Err(StoreError::Conflict(format!("user name {}", user.name)));
    }
    Ok(())
}

fn query_all<T>(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
    map: fn(&Row<'_>) -> rusqlite::Result<T>,
) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, map)?;
    rows.collect::<rusqlite::Result<Vec<T>>>()
        .map_err(StoreError::from)
}

#[async_trait]
impl Store for SqliteStore {
    async fn apply(&self, batch: Vec<Mutation>) -> Result<()> {
        let count = batch.len();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            for mutation in batch {
                apply_mutation(&tx, mutation)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await?;

        tracing::trace!(mutations = count, "applied batch");
        Ok(())
    }

    async fn get_meta(&self) -> Result<Option<VaultMeta>> {
        self.blocking(|conn| {
            let row: Option<(Vec<u8>, i64)> = conn
                .query_row(
                    "SELECT escrow_public, bootstrapped_at FROM vault_meta WHERE singleton = 1",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            row.map(|(public, bootstrapped_at)| {
                let public: [u8; 32] = public.try_into().map_err(|_| {
                    StoreError::InvalidData("escrow public key is not 32 bytes".into())
                })?;
                Ok(VaultMeta {
                    escrow_public: EscrowPublicKey::from_bytes(public),
                    bootstrapped_at,
                })
            })
            .transpose()
        })
        .await
    }

    async fn get_user(&self, id: &UserId) -> Result<Option<UserRecord>> {
        let id = *id;
        self.blocking(move |conn| {
            conn.query_row(
                &format!("SELECT {} FROM principal_user WHERE user_id = ?1", USER_COLUMNS),
                params![id.as_bytes().as_slice()],
                row_to_user,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn find_user_by_name(&self, name: &str) -> Result<Option<UserRecord>> {
        let name = name.to_string();
        self.blocking(move |conn| {
            conn.query_row(
                &format!("SELECT {} FROM principal_user WHERE name = ?1", USER_COLUMNS),
                params![name],
                row_to_user,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn list_users(&self) -> Result<Vec<UserRecord>> {
        self.blocking(|conn| {
            query_all(
                conn,
                &format!("SELECT {} FROM principal_user ORDER BY user_id", USER_COLUMNS),
                [],
                row_to_user,
            )
        })
        .await
    }

    async fn get_group(&self, id: &GroupId) -> Result<Option<GroupRecord>> {
        let id = *id;
        self.blocking(move |conn| {
            conn.query_row(
                &format!("SELECT {} FROM principal_group WHERE group_id = ?1", GROUP_COLUMNS),
                params![id.as_bytes().as_slice()],
                row_to_group,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn list_groups(&self) -> Result<Vec<GroupRecord>> {
        self.blocking(|conn| {
            query_all(
                conn,
                &format!("SELECT {} FROM principal_group ORDER BY group_id", GROUP_COLUMNS),
                [],
                row_to_group,
            )
        })
        .await
    }

    async fn get_membership(
        &self,
        user_id: &UserId,
        group_id: &GroupId,
    ) -> Result<Option<MembershipRecord>> {
        let (user_id, group_id) = (*user_id, *group_id);
        self.blocking(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM membership WHERE user_id = ?1 AND group_id = ?2",
                    MEMBERSHIP_COLUMNS
                ),
                params![user_id.as_bytes().as_slice(), group_id.as_bytes().as_slice()],
                row_to_membership,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn memberships_for_user(&self, user_id: &UserId) -> Result<Vec<MembershipRecord>> {
        let user_id = *user_id;
        self.blocking(move |conn| {
            query_all(
                conn,
                &format!(
                    "SELECT {} FROM membership WHERE user_id = ?1 ORDER BY group_id",
                    MEMBERSHIP_COLUMNS
                ),
                params![user_id.as_bytes().as_slice()],
                row_to_membership,
            )
        })
        .await
    }

    async fn members_of(&self, group_id: &GroupId) -> Result<Vec<MembershipRecord>> {
        let group_id = *group_id;
        self.blocking(move |conn| {
            query_all(
                conn,
                &format!(
                    "SELECT {} FROM membership WHERE group_id = ?1 ORDER BY user_id",
                    MEMBERSHIP_COLUMNS
                ),
                params![group_id.as_bytes().as_slice()],
                row_to_membership,
            )
        })
        .await
    }

    async fn get_grant(
        &self,
        principal: &Principal,
        secret_id: &SecretId,
    ) -> Result<Option<GrantRecord>> {
        let (principal, secret_id) = (*principal, *secret_id);
        self.blocking(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM access_grant
                     WHERE kind = ?1 AND principal_id = ?2 AND secret_id = ?3",
                    GRANT_COLUMNS
                ),
                params![
                    principal.kind() as u8,
                    principal.id_bytes().as_slice(),
                    secret_id.as_bytes().as_slice(),
                ],
                row_to_grant,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn grants_for_secret(&self, secret_id: &SecretId) -> Result<Vec<GrantRecord>> {
        let secret_id = *secret_id;
        self.blocking(move |conn| {
            query_all(
                conn,
                &format!(
                    "SELECT {} FROM access_grant WHERE secret_id = ?1
                     ORDER BY kind, principal_id",
                    GRANT_COLUMNS
                ),
                params![secret_id.as_bytes().as_slice()],
                row_to_grant,
            )
        })
        .await
    }

    async fn grants_for_principal(&self, principal: &Principal) -> Result<Vec<GrantRecord>> {
        let principal = *principal;
        self.blocking(move |conn| {
            query_all(
                conn,
                &format!(
                    "SELECT {} FROM access_grant WHERE kind = ?1 AND principal_id = ?2
                     ORDER BY secret_id",
                    GRANT_COLUMNS
                ),
                params![principal.kind() as u8, principal.id_bytes().as_slice()],
                row_to_grant,
            )
        })
        .await
    }

    async fn get_secret(&self, id: &SecretId) -> Result<Option<SecretRecord>> {
        let id = *id;
        self.blocking(move |conn| {
            conn.query_row(
                &format!("SELECT {} FROM secret WHERE secret_id = ?1", SECRET_COLUMNS),
                params![id.as_bytes().as_slice()],
                row_to_secret,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn approver_roles(&self, secret_id: &SecretId) -> Result<Vec<ApproverRole>> {
        let secret_id = *secret_id;
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT kind, principal_id FROM approver_role WHERE secret_id = ?1
                 ORDER BY kind, principal_id",
            )?;
            let rows = stmt.query_map(params![secret_id.as_bytes().as_slice()], |row| {
                let kind: u8 = row.get(0)?;
                Ok(ApproverRole {
                    secret_id,
                    principal: principal_from(kind, id_column(row, 1)?, 0)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(StoreError::from)
        })
        .await
    }

    async fn get_request(&self, id: &RequestId) -> Result<Option<RaRequestRecord>> {
        let id = *id;
        self.blocking(move |conn| {
            conn.query_row(
                &format!("SELECT {} FROM ra_request WHERE request_id = ?1", REQUEST_COLUMNS),
                params![id.as_bytes().as_slice()],
                row_to_request,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn latest_request(
        &self,
        secret_id: &SecretId,
        requester: &UserId,
    ) -> Result<Option<RaRequestRecord>> {
        let (secret_id, requester) = (*secret_id, *requester);
        self.blocking(move |conn| latest_request(conn, &secret_id, &requester))
            .await
    }

    async fn insert_request_if_none_live(
        &self,
        request: RaRequestRecord,
        approvers: Vec<UserId>,
        now: i64,
    ) -> Result<RaRequestRecord> {
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if let Some(live) = latest_request(&tx, &request.secret_id, &request.requester)?
                .filter(|r| !r.is_expired(now))
            {
                return Ok(live);
            }
            insert_request(&tx, &request, &approvers)?;
            tx.commit()?;
            Ok(request)
        })
        .await
    }

    async fn requests_awaiting(&self, approver: &UserId) -> Result<Vec<RaRequestRecord>> {
        let approver = *approver;
        self.blocking(move |conn| {
            query_all(
                conn,
                "SELECT r.request_id, r.secret_id, r.requester_id, r.approver_list_id,
                        r.request_time, r.viewed_time, r.reason, r.lifetime_ms
                 FROM ra_request r
                 JOIN ra_approver_list a ON a.list_id = r.approver_list_id
                 WHERE a.user_id = ?1 AND a.state = ?2
                 ORDER BY r.request_time",
                params![approver.as_bytes().as_slice(), ApproverState::Unset as u8],
                row_to_request,
            )
        })
        .await
    }

    async fn approver_entries(&self, list_id: &ApproverListId) -> Result<Vec<ApproverEntry>> {
        let list_id = *list_id;
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id, state FROM ra_approver_list WHERE list_id = ?1 ORDER BY user_id",
            )?;
            let rows = stmt.query_map(params![list_id.as_bytes().as_slice()], |row| {
                let state: u8 = row.get(1)?;
                Ok(ApproverEntry {
                    list_id,
                    user_id: UserId::from_bytes(id_column(row, 0)?),
                    state: ApproverState::from_u8(state)
                        .ok_or_else(|| invalid_column(1, format!("unknown vote {}", state)))?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(StoreError::from)
        })
        .await
    }

    async fn cast_vote(
        &self,
        list_id: &ApproverListId,
        user_id: &UserId,
        state: ApproverState,
    ) -> Result<bool> {
        let (list_id, user_id) = (*list_id, *user_id);
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE ra_approver_list SET state = ?3 WHERE list_id = ?1 AND user_id = ?2",
                params![
                    list_id.as_bytes().as_slice(),
                    user_id.as_bytes().as_slice(),
                    state as u8,
                ],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn mark_viewed(&self, id: &RequestId, at: i64) -> Result<bool> {
        let id = *id;
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE ra_request SET viewed_time = ?2
                 WHERE request_id = ?1 AND viewed_time IS NULL",
                params![id.as_bytes().as_slice(), at],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn append_audit(&self, record: &AuditRecord) -> Result<u64> {
        let record = record.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO audit_log (time, secret_id, user_id, event, stamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.time,
                    record.secret_id.map(|s| s.as_bytes().to_vec()),
                    record.user_id.as_bytes().as_slice(),
                    record.event,
                    record.stamp,
                ],
            )?;
            Ok(conn.last_insert_rowid() as u64)
        })
        .await
    }

    async fn get_audit(&self, id: u64) -> Result<Option<AuditRecord>> {
        self.blocking(move |conn| {
            conn.query_row(
                &format!("SELECT {} FROM audit_log WHERE entry_id = ?1", AUDIT_COLUMNS),
                params![id as i64],
                row_to_audit,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn audit_between(
        &self,
        start: i64,
        end: i64,
        filter: &AuditFilter,
    ) -> Result<Vec<AuditRecord>> {
        let filter = *filter;
        self.blocking(move |conn| {
            query_all(
                conn,
                &format!(
                    "SELECT {} FROM audit_log
                     WHERE time >= ?1 AND time <= ?2
                       AND (?3 IS NULL OR user_id = ?3)
                       AND (?4 IS NULL OR secret_id = ?4)
                     ORDER BY time, entry_id",
                    AUDIT_COLUMNS
                ),
                params![
                    start,
                    end,
                    filter.user_id.map(|u| u.as_bytes().to_vec()),
                    filter.secret_id.map(|s| s.as_bytes().to_vec()),
                ],
                row_to_audit,
            )
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::StoreExt;
    use keyward_core::{SymmetricKey, WrappedKey};

    fn wrapped() -> WrappedKey {
        WrappedKey::seal(&[1u8; 32], &SymmetricKey::generate()).unwrap()
    }

    fn user(name: &str) -> UserRecord {
        UserRecord {
            id: UserId::generate(),
            name: name.to_string(),
            login_salt: [7u8; 16],
            key_by_login: wrapped(),
            key_by_admin: wrapped(),
            status: PrincipalStatus::Enabled,
            failed_logins: 0,
            key_rotated_at: None,
        }
    }

    fn secret(restricted: Option<RestrictedAccessPolicy>) -> SecretRecord {
        SecretRecord {
            id: SecretId::generate(),
            name: "prod-db".into(),
            payload: vec![9, 9, 9],
            restricted,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    #[tokio::test]
    async fn test_user_roundtrip() {
        let store = SqliteStore::open_memory().unwrap();
        let alice = user("alice");
        store
            .apply_one(Mutation::InsertUser(alice.clone()))
            .await
            .unwrap();

        assert_eq!(store.get_user(&alice.id).await.unwrap(), Some(alice.clone()));
        assert_eq!(store.find_user_by_name("alice").await.unwrap(), Some(alice));
        assert!(store.find_user_by_name("bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_user_name_conflicts() {
        let store = SqliteStore::open_memory().unwrap();
        store
            .apply_one(Mutation::InsertUser(user("alice")))
            .await
            .unwrap();

        let result = store.apply_one(Mutation::InsertUser(user("alice"))).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_batch_rolls_back_on_failure() {
        let store = SqliteStore::open_memory().unwrap();
        let alice = user("alice");
        store
            .apply_one(Mutation::InsertUser(alice.clone()))
            .await
            .unwrap();

        let result = store
            .apply(vec![
                Mutation::SetUserKeys {
                    user_id: alice.id,
                    expected_login: alice.key_by_login.clone(),
                    login_salt: [8u8; 16],
                    key_by_login: wrapped(),
                    key_by_admin: wrapped(),
                    rotated_at: Some(2_000),
                },
                Mutation::PutGrant(GrantRecord {
                    principal: Principal::User(alice.id),
                    secret_id: SecretId::generate(),
                    read_key: Some(wrapped()),
                    modify_key: None,
                }),
            ])
            .await;

        assert!(matches!(result, Err(StoreError::NotFound(_))));
        let stored = store.get_user(&alice.id).await.unwrap().unwrap();
        assert_eq!(stored, alice);
    }

    #[tokio::test]
    async fn test_user_key_writes_are_conditional() {
        let store = SqliteStore::open_memory().unwrap();
        let alice = user("alice");
        store
            .apply_one(Mutation::InsertUser(alice.clone()))
            .await
            .unwrap();

        let fresh = wrapped();
        store
            .apply_one(Mutation::SetUserKeys {
                user_id: alice.id,
                expected_login: alice.key_by_login.clone(),
                login_salt: [1u8; 16],
                key_by_login: fresh.clone(),
                key_by_admin: alice.key_by_admin.clone(),
                rotated_at: Some(1_500),
            })
            .await
            .unwrap();

        let stale = store
            .apply_one(Mutation::SetUserKeys {
                user_id: alice.id,
                expected_login: alice.key_by_login.clone(),
                login_salt: [2u8; 16],
                key_by_login: wrapped(),
                key_by_admin: wrapped(),
                rotated_at: None,
            })
            .await;
        assert!(matches!(stale, Err(StoreError::Conflict(_))));

        // A password change keeps the recorded rotation time.
        store
            .apply_one(Mutation::SetUserKeys {
                user_id: alice.id,
                expected_login: fresh.clone(),
                login_salt: [3u8; 16],
                key_by_login: wrapped(),
                key_by_admin: alice.key_by_admin.clone(),
                rotated_at: None,
            })
            .await
            .unwrap();
        let stored = store.get_user(&alice.id).await.unwrap().unwrap();
        assert_eq!(stored.login_salt, [3u8; 16]);
        assert_eq!(stored.key_rotated_at, Some(1_500));

        let missing = store
            .apply_one(Mutation::SetUserKeys {
                user_id: UserId::generate(),
                expected_login: fresh,
                login_salt: [0u8; 16],
                key_by_login: wrapped(),
                key_by_admin: wrapped(),
                rotated_at: None,
            })
            .await;
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_login_counter_and_status_columns() {
        let store = SqliteStore::open_memory().unwrap();
        let alice = user("alice");
        store
            .apply_one(Mutation::InsertUser(alice.clone()))
            .await
            .unwrap();

        let fail = Mutation::RecordFailedLogin {
            user_id: alice.id,
            threshold: 2,
        };
        store.apply_one(fail.clone()).await.unwrap();
        let stored = store.get_user(&alice.id).await.unwrap().unwrap();
        assert_eq!((stored.failed_logins, stored.status), (1, PrincipalStatus::Enabled));
        assert_eq!(stored.key_by_login, alice.key_by_login);

        store.apply_one(fail).await.unwrap();
        let stored = store.get_user(&alice.id).await.unwrap().unwrap();
        assert_eq!((stored.failed_logins, stored.status), (2, PrincipalStatus::Disabled));

        store
            .apply_one(Mutation::ResetFailedLogins(alice.id))
            .await
            .unwrap();
        let stored = store.get_user(&alice.id).await.unwrap().unwrap();
        assert_eq!((stored.failed_logins, stored.status), (0, PrincipalStatus::Disabled));

        store
            .apply(vec![
                Mutation::RecordFailedLogin {
                    user_id: alice.id,
                    threshold: 0,
                },
                Mutation::SetUserStatus {
                    user_id: alice.id,
                    status: PrincipalStatus::Enabled,
                },
            ])
            .await
            .unwrap();
        let stored = store.get_user(&alice.id).await.unwrap().unwrap();
        assert_eq!((stored.failed_logins, stored.status), (0, PrincipalStatus::Enabled));

        store
            .apply_one(Mutation::SetUserStatus {
                user_id: alice.id,
                status: PrincipalStatus::Deleted,
            })
            .await
            .unwrap();
        let result = store
            .apply_one(Mutation::ResetFailedLogins(alice.id))
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_rewrap_requires_unchanged_rows() {
        let store = SqliteStore::open_memory().unwrap();
        let alice = user("alice");
        let group = GroupRecord {
            id: GroupId::generate(),
            name: "ops".into(),
            status: PrincipalStatus::Enabled,
            key_by_admin: Some(wrapped()),
        };
        let s = secret(None);
        let membership = MembershipRecord {
            user_id: alice.id,
            group_id: group.id,
            group_key: Some(wrapped()),
        };
        let grant = GrantRecord {
            principal: Principal::User(alice.id),
            secret_id: s.id,
            read_key: Some(wrapped()),
            modify_key: None,
        };
        store
            .apply(vec![
                Mutation::InsertUser(alice.clone()),
                Mutation::InsertGroup(group.clone()),
                Mutation::PutMembership(membership.clone()),
                Mutation::PutSecret(s.clone()),
                Mutation::PutGrant(grant.clone()),
            ])
            .await
            .unwrap();

        let new_read = wrapped();
        let new_group_key = wrapped();
        store
            .apply(vec![
                Mutation::ExpectGrants {
                    principal: grant.principal,
                    secret_ids: vec![s.id],
                },
                Mutation::ExpectMemberships {
                    user_id: alice.id,
                    group_ids: vec![group.id],
                },
                Mutation::RewrapGrant {
                    expected: grant.clone(),
                    read_key: Some(new_read.clone()),
                    modify_key: None,
                },
                Mutation::RewrapMembership {
                    expected: membership.clone(),
                    group_key: Some(new_group_key.clone()),
                },
            ])
            .await
            .unwrap();
        let stored = store.get_grant(&grant.principal, &s.id).await.unwrap().unwrap();
        assert_eq!(stored.read_key, Some(new_read.clone()));

        // The old ciphertext is gone, so replaying the same rewrap conflicts.
        let replay = store
            .apply_one(Mutation::RewrapGrant {
                expected: grant.clone(),
                read_key: Some(wrapped()),
                modify_key: None,
            })
            .await;
        assert!(matches!(replay, Err(StoreError::Conflict(_))));

        store
            .apply_one(Mutation::DeleteMembership {
                user_id: alice.id,
                group_id: group.id,
            })
            .await
            .unwrap();
        let mut current = membership;
        current.group_key = Some(new_group_key);
        let result = store
            .apply(vec![
                Mutation::RewrapGrant {
                    expected: stored,
                    read_key: Some(wrapped()),
                    modify_key: None,
                },
                Mutation::RewrapMembership {
                    expected: current,
                    group_key: Some(wrapped()),
                },
            ])
            .await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
        assert!(store
            .get_membership(&alice.id, &group.id)
            .await
            .unwrap()
            .is_none());
        let kept = store.get_grant(&grant.principal, &s.id).await.unwrap().unwrap();
        assert_eq!(kept.read_key, Some(new_read));

        let result = store
            .apply_one(Mutation::ExpectMemberships {
                user_id: alice.id,
                group_ids: vec![group.id],
            })
            .await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_share_one_live_request() {
        let store = Arc::new(SqliteStore::open_memory().unwrap());
        let secret_id = SecretId::generate();
        let requester = UserId::generate();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let request = RaRequestRecord {
                    id: RequestId::generate(),
                    secret_id,
                    requester,
                    approver_list: ApproverListId::generate(),
                    request_time: 1_000,
                    viewed_time: None,
                    reason: "incident".into(),
                    lifetime_ms: 60_000,
                };
                store
                    .insert_request_if_none_live(request, vec![UserId::generate()], 1_000)
                    .await
                    .unwrap()
                    .id
            }));
        }

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);

        let count: u32 = store
            .blocking(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM ra_request", [], |row| row.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(count, 1);
        let listed: u32 = store
            .blocking(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM ra_approver_list", [], |row| row.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(listed, 1);
    }

    #[tokio::test]
    async fn test_secret_policy_roundtrip() {
        let store = SqliteStore::open_memory().unwrap();
        let policy = RestrictedAccessPolicy {
            required_approvers: 2,
            required_blockers: 1,
        };
        let s = secret(Some(policy));
        store.apply_one(Mutation::PutSecret(s.clone())).await.unwrap();

        assert_eq!(store.get_secret(&s.id).await.unwrap(), Some(s));
    }

    #[tokio::test]
    async fn test_grants_and_admin_protection() {
        let store = SqliteStore::open_memory().unwrap();
        let s = secret(None);
        let alice = Principal::User(UserId::generate());
        let admin = Principal::Group(GroupId::ADMIN);

        store
            .apply(vec![
                Mutation::PutSecret(s.clone()),
                Mutation::PutGrant(GrantRecord {
                    principal: alice,
                    secret_id: s.id,
                    read_key: Some(wrapped()),
                    modify_key: Some(wrapped()),
                }),
                Mutation::PutGrant(GrantRecord {
                    principal: admin,
                    secret_id: s.id,
                    read_key: Some(wrapped()),
                    modify_key: Some(wrapped()),
                }),
            ])
            .await
            .unwrap();

        let grant = store.get_grant(&alice, &s.id).await.unwrap().unwrap();
        assert!(grant.can_modify());
        assert_eq!(store.grants_for_principal(&alice).await.unwrap().len(), 1);

        store
            .apply_one(Mutation::DeleteGrantsForSecret(s.id))
            .await
            .unwrap();
        let remaining = store.grants_for_secret(&s.id).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].principal, admin);

        store.apply_one(Mutation::DeleteSecret(s.id)).await.unwrap();
        assert!(store.grants_for_secret(&s.id).await.unwrap().is_empty());
        assert!(store.get_secret(&s.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_votes_are_conditional_updates() {
        let store = SqliteStore::open_memory().unwrap();
        let approver = UserId::generate();
        let request = RaRequestRecord {
            id: RequestId::generate(),
            secret_id: SecretId::generate(),
            requester: UserId::generate(),
            approver_list: ApproverListId::generate(),
            request_time: 500,
            viewed_time: None,
            reason: "on-call".into(),
            lifetime_ms: 600_000,
        };
        let stored = store
            .insert_request_if_none_live(request.clone(), vec![approver], 500)
            .await
            .unwrap();
        assert_eq!(stored, request);

        assert!(store
            .cast_vote(&request.approver_list, &approver, ApproverState::Block)
            .await
            .unwrap());
        assert!(store
            .cast_vote(&request.approver_list, &approver, ApproverState::Approve)
            .await
            .unwrap());
        assert!(!store
            .cast_vote(&request.approver_list, &request.requester, ApproverState::Approve)
            .await
            .unwrap());

        let entries = store.approver_entries(&request.approver_list).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].state, ApproverState::Approve);

        let latest = store
            .latest_request(&request.secret_id, &request.requester)
            .await
            .unwrap();
        assert_eq!(latest, Some(request));
    }

    #[tokio::test]
    async fn test_audit_append_and_query() {
        let store = SqliteStore::open_memory().unwrap();
        let secret_id = SecretId::generate();
        let first = store
            .append_audit(&AuditRecord {
                id: 0,
                time: 100,
                secret_id: Some(secret_id),
                user_id: UserId::NONE,
                event: "created".into(),
                stamp: Some(vec![1, 2, 3]),
            })
            .await
            .unwrap();
        store
            .append_audit(&AuditRecord {
                id: 0,
                time: 200,
                secret_id: None,
                user_id: UserId::NONE,
                event: "login".into(),
                stamp: None,
            })
            .await
            .unwrap();

        let stored = store.get_audit(first).await.unwrap().unwrap();
        assert_eq!(stored.event, "created");
        assert_eq!(stored.stamp, Some(vec![1, 2, 3]));

        let filter = AuditFilter {
            user_id: None,
            secret_id: Some(secret_id),
        };
        let entries = store.audit_between(0, 1000, &filter).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, first);
    }

    #[tokio::test]
    async fn test_reopen_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.db");
        let alice = user("alice");

        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .apply_one(Mutation::InsertUser(alice.clone()))
                .await
                .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get_user(&alice.id).await.unwrap(), Some(alice));
    }
}
