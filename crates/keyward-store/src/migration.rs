//! Database schema migrations for SQLite.
//!
//! Each migration is a SQL batch that transforms the schema from version N
//! to N+1. Applied versions are recorded in `schema_migrations`.

use rusqlite::Connection;

use keyward_core::now_millis;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 3;

/// Initialize or migrate the database schema.
///
/// This function is idempotent - it can be called multiple times safely.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            tracing::debug!(version, "applying schema migration");
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
        }

        tx.commit()?;
    }

    Ok(())
}

/// Apply a specific migration version.
fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        2 => apply_v2(conn),
        3 => apply_v3(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: principals, secrets, grants and the audit log.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Single-row vault metadata
        CREATE TABLE vault_meta (
            singleton INTEGER PRIMARY KEY CHECK (singleton = 1),
            escrow_public BLOB NOT NULL,      -- 32 bytes, X25519 public key
            bootstrapped_at INTEGER NOT NULL
        );

        CREATE TABLE principal_user (
            user_id BLOB PRIMARY KEY,         -- 16 bytes
            name TEXT NOT NULL UNIQUE,
            login_salt BLOB NOT NULL,
            key_by_login BLOB NOT NULL,       -- CBOR WrappedKey
            key_by_admin BLOB NOT NULL,       -- CBOR WrappedKey (escrow)
            status INTEGER NOT NULL,          -- 0=enabled, 1=disabled, 2=deleted
            failed_logins INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE principal_group (
            group_id BLOB PRIMARY KEY,
            name TEXT NOT NULL,
            status INTEGER NOT NULL,
            key_by_admin BLOB                 -- NULL only for the admin group
        );

        CREATE TABLE membership (
            user_id BLOB NOT NULL REFERENCES principal_user(user_id),
            group_id BLOB NOT NULL REFERENCES principal_group(group_id),
            group_key BLOB,                   -- group key wrapped for the user
            PRIMARY KEY (user_id, group_id)
        );

        CREATE TABLE secret (
            secret_id BLOB PRIMARY KEY,
            name TEXT NOT NULL,
            payload BLOB NOT NULL,            -- sealed blob
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE access_grant (
            kind INTEGER NOT NULL,            -- 0=user, 1=group
            principal_id BLOB NOT NULL,
            secret_id BLOB NOT NULL REFERENCES secret(secret_id),
            read_key BLOB,
            modify_key BLOB,
            PRIMARY KEY (kind, principal_id, secret_id)
        );

        CREATE TABLE audit_log (
            entry_id INTEGER PRIMARY KEY AUTOINCREMENT,
            time INTEGER NOT NULL,
            secret_id BLOB,
            user_id BLOB NOT NULL,            -- ff.. sentinel when no user acted
            event TEXT NOT NULL,
            stamp BLOB
        );

        CREATE INDEX idx_membership_group ON membership(group_id);
        CREATE INDEX idx_grant_secret ON access_grant(secret_id);
        CREATE INDEX idx_audit_time ON audit_log(time);
        "#,
    )?;

    Ok(())
}

/// Migration v2: restricted access.
fn apply_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        ALTER TABLE secret ADD COLUMN required_approvers INTEGER;
        ALTER TABLE secret ADD COLUMN required_blockers INTEGER;

        CREATE TABLE approver_role (
            secret_id BLOB NOT NULL,
            kind INTEGER NOT NULL,
            principal_id BLOB NOT NULL,
            PRIMARY KEY (secret_id, kind, principal_id)
        );

        CREATE TABLE ra_request (
            request_id BLOB PRIMARY KEY,
            secret_id BLOB NOT NULL,
            requester_id BLOB NOT NULL,
            approver_list_id BLOB NOT NULL UNIQUE,
            request_time INTEGER NOT NULL,
            viewed_time INTEGER,
            reason TEXT NOT NULL,
            lifetime_ms INTEGER NOT NULL
        );

        CREATE TABLE ra_approver_list (
            list_id BLOB NOT NULL,
            user_id BLOB NOT NULL,
            state INTEGER NOT NULL DEFAULT 0, -- 0=unset, 1=approve, 2=block
            PRIMARY KEY (list_id, user_id)
        );

        CREATE INDEX idx_ra_request_lookup ON ra_request(secret_id, requester_id);
        CREATE INDEX idx_ra_approver_user ON ra_approver_list(user_id, state);
        "#,
    )?;

    Ok(())
}

/// V3: when each user's key was last rotated.
fn apply_v3(conn: &Connection) -> Result<()> {
    conn.execute_batch("ALTER TABLE principal_user ADD COLUMN key_rotated_at INTEGER;")?;
    Ok(())
}
