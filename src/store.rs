//! Credential store
//!
//! SQLite-backed table of accounts, their per-protocol grants and tunnel
//! sessions. Every write runs in a single short transaction; the connection
//! sits behind a mutex so writers on the same row never interleave.
//!
//! Timestamps are stored with microsecond precision, and every timestamp
//! handed back to callers is truncated the same way.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::{PanelError, PanelResult};
use crate::protocol::{
    Account, AccountRole, GrantSecret, GrantStatus, HashedPassword, KdfParams, ProtocolGrant,
    ProtocolKind, Session,
};
use crate::validation;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    username      TEXT NOT NULL UNIQUE,
    password_salt BLOB NOT NULL,
    password_key  BLOB NOT NULL,
    kdf_params    TEXT NOT NULL,
    role          TEXT NOT NULL DEFAULT 'user',
    created_at    TEXT NOT NULL,
    last_login    TEXT
);

CREATE TABLE IF NOT EXISTS grants (
    account_id  INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
    kind        TEXT NOT NULL,
    enabled     INTEGER NOT NULL,
    secret      TEXT,
    status      TEXT NOT NULL,
    last_error  TEXT,
    updated_at  TEXT NOT NULL,
    PRIMARY KEY (account_id, kind)
);

CREATE INDEX IF NOT EXISTS grants_kind_status ON grants(kind, status);

CREATE TABLE IF NOT EXISTS sessions (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id      INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
    kind            TEXT NOT NULL,
    client_ip       TEXT NOT NULL,
    connected_at    TEXT NOT NULL,
    disconnected_at TEXT
);

CREATE INDEX IF NOT EXISTS sessions_open ON sessions(kind, disconnected_at);
"#;

/// Closed set of account columns that may change after creation
#[derive(Debug, Clone)]
pub enum AccountUpdate {
    Password(HashedPassword),
    LastLogin(DateTime<Utc>),
    Role(AccountRole),
}

/// Fields of a grant to change; `None` leaves the column untouched
#[derive(Debug, Clone, Default)]
pub struct GrantFields {
    pub enabled: Option<bool>,
    pub secret: Option<GrantSecret>,
    pub status: Option<GrantStatus>,
    /// `Some(None)` clears the last error
    pub last_error: Option<Option<String>>,
}

impl GrantFields {
    /// Record the outcome of a transition
    pub fn status(status: GrantStatus, error: Option<String>) -> Self {
        Self {
            status: Some(status),
            last_error: Some(error),
            ..Default::default()
        }
    }
}

/// SQLite-backed credential store
pub struct CredentialStore {
    conn: Mutex<Connection>,
}

impl CredentialStore {
    /// Open (and migrate) the store at `path`
    pub fn open(path: &Path) -> PanelResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| PanelError::Store(format!("open {:?}: {}", path, e)))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;",
        )?;
        let store = Self { conn: Mutex::new(conn) };
        store.run_migrations()?;
        info!("Opened credential store at {:?}", path);
        Ok(store)
    }

    /// Open an existing store without write access
    ///
    /// A missing database reads as an empty store and nothing is created.
    pub fn open_read_only(path: &Path) -> PanelResult<Self> {
        if !path.exists() {
            debug!("No credential store at {:?}, using an empty one", path);
            return Self::open_in_memory();
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| PanelError::Store(format!("open {:?}: {}", path, e)))?;
        conn.execute_batch("PRAGMA busy_timeout=5000;")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> PanelResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let store = Self { conn: Mutex::new(conn) };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> PanelResult<()> {
        self.lock()?
            .execute_batch(SCHEMA)
            .map_err(|e| PanelError::Store(format!("migration failed: {}", e)))
    }

    fn lock(&self) -> PanelResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| PanelError::Store(e.to_string()))
    }

    /// Create an account together with Pending grants for `kinds`
    ///
    /// The account row and all grant rows commit atomically.
    pub fn create_account(
        &self,
        username: &str,
        password: &HashedPassword,
        kinds: &[ProtocolKind],
    ) -> PanelResult<Account> {
        validation::validate_username(username)?;

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if account_id(&tx, username)?.is_some() {
            return Err(PanelError::DuplicateUsername(username.to_string()));
        }

        let now = now();
        let role = AccountRole::default();
        tx.execute(
            "INSERT INTO accounts (username, password_salt, password_key, kdf_params, role, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                username,
                password.salt,
                password.key,
                password.params.encode(),
                role.as_str(),
                timestamp(&now)
            ],
        )?;
        let id = tx.last_insert_rowid();

        for kind in kinds {
            tx.execute(
                "INSERT OR IGNORE INTO grants (account_id, kind, enabled, status, updated_at)
                 VALUES (?1, ?2, 1, ?3, ?4)",
                params![id, kind.as_str(), GrantStatus::Pending.as_str(), timestamp(&now)],
            )?;
        }

        tx.commit()?;
        debug!("Created account {} with {} grant(s)", username, kinds.len());

        Ok(Account {
            username: username.to_string(),
            password: password.clone(),
            role,
            created_at: now,
            last_login: None,
        })
    }

    pub fn get_account(&self, username: &str) -> PanelResult<Account> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT username, password_salt, password_key, kdf_params, role, created_at, last_login
             FROM accounts WHERE username = ?1",
            params![username],
            row_to_account,
        )
        .optional()?
        .ok_or_else(|| PanelError::NotFound(format!("Account '{}'", username)))?
    }

    /// All accounts, oldest first
    pub fn list_accounts(&self) -> PanelResult<Vec<Account>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT username, password_salt, password_key, kdf_params, role, created_at, last_login
             FROM accounts ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map([], row_to_account)?;

        let mut accounts = Vec::new();
        for row in rows {
            accounts.push(row??);
        }
        Ok(accounts)
    }

    pub fn update_account(&self, username: &str, update: AccountUpdate) -> PanelResult<()> {
        let conn = self.lock()?;
        let changed = match update {
            AccountUpdate::Password(hashed) => conn.execute(
                "UPDATE accounts SET password_salt = ?2, password_key = ?3, kdf_params = ?4
                 WHERE username = ?1",
                params![username, hashed.salt, hashed.key, hashed.params.encode()],
            )?,
            AccountUpdate::LastLogin(at) => conn.execute(
                "UPDATE accounts SET last_login = ?2 WHERE username = ?1",
                params![username, timestamp(&at)],
            )?,
            AccountUpdate::Role(role) => conn.execute(
                "UPDATE accounts SET role = ?2 WHERE username = ?1",
                params![username, role.as_str()],
            )?,
        };

        if changed == 0 {
            return Err(PanelError::NotFound(format!("Account '{}'", username)));
        }
        Ok(())
    }

    /// Remove an account with its grant and session rows
    pub fn delete_account(&self, username: &str) -> PanelResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let id = account_id(&tx, username)?
            .ok_or_else(|| PanelError::NotFound(format!("Account '{}'", username)))?;

        tx.execute("DELETE FROM sessions WHERE account_id = ?1", params![id])?;
        tx.execute("DELETE FROM grants WHERE account_id = ?1", params![id])?;
        tx.execute("DELETE FROM accounts WHERE id = ?1", params![id])?;
        tx.commit()?;
        debug!("Deleted account {}", username);
        Ok(())
    }

    /// Create or update the grant for (`username`, `kind`)
    pub fn set_grant(
        &self,
        username: &str,
        kind: ProtocolKind,
        fields: GrantFields,
    ) -> PanelResult<ProtocolGrant> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let id = account_id(&tx, username)?
            .ok_or_else(|| PanelError::NotFound(format!("Account '{}'", username)))?;

        let now = timestamp(&now());
        tx.execute(
            "INSERT OR IGNORE INTO grants (account_id, kind, enabled, status, updated_at)
             VALUES (?1, ?2, 0, ?3, ?4)",
            params![id, kind.as_str(), GrantStatus::Disabled.as_str(), now],
        )?;

        if let Some(enabled) = fields.enabled {
            tx.execute(
                "UPDATE grants SET enabled = ?3 WHERE account_id = ?1 AND kind = ?2",
                params![id, kind.as_str(), enabled],
            )?;
        }
        if let Some(secret) = &fields.secret {
            tx.execute(
                "UPDATE grants SET secret = ?3 WHERE account_id = ?1 AND kind = ?2",
                params![id, kind.as_str(), serde_json::to_string(secret)?],
            )?;
        }
        if let Some(status) = fields.status {
            tx.execute(
                "UPDATE grants SET status = ?3 WHERE account_id = ?1 AND kind = ?2",
                params![id, kind.as_str(), status.as_str()],
            )?;
        }
        if let Some(last_error) = &fields.last_error {
            tx.execute(
                "UPDATE grants SET last_error = ?3 WHERE account_id = ?1 AND kind = ?2",
                params![id, kind.as_str(), last_error],
            )?;
        }
        tx.execute(
            "UPDATE grants SET updated_at = ?3 WHERE account_id = ?1 AND kind = ?2",
            params![id, kind.as_str(), now],
        )?;

        let grant = query_grant(&tx, id, username, kind)?
            .ok_or_else(|| PanelError::Store(format!("grant {}/{} vanished", username, kind)))?;
        tx.commit()?;
        Ok(grant)
    }

    pub fn grant(&self, username: &str, kind: ProtocolKind) -> PanelResult<Option<ProtocolGrant>> {
        let conn = self.lock()?;
        let id = account_id(&conn, username)?
            .ok_or_else(|| PanelError::NotFound(format!("Account '{}'", username)))?;
        query_grant(&conn, id, username, kind)
    }

    /// Every grant of `username`, in protocol order
    pub fn grants(&self, username: &str) -> PanelResult<Vec<ProtocolGrant>> {
        let conn = self.lock()?;
        let id = account_id(&conn, username)?
            .ok_or_else(|| PanelError::NotFound(format!("Account '{}'", username)))?;

        let mut stmt = conn.prepare(
            "SELECT kind, enabled, secret, status, last_error, updated_at
             FROM grants WHERE account_id = ?1",
        )?;
        let rows = stmt.query_map(params![id], |row| row_to_grant(row, username))?;

        let mut grants = Vec::new();
        for row in rows {
            grants.push(row??);
        }
        grants.sort_by_key(|g| g.kind);
        Ok(grants)
    }

    /// Every stored grant of one kind, oldest account first
    pub fn grants_of_kind(&self, kind: ProtocolKind) -> PanelResult<Vec<ProtocolGrant>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT a.username, g.kind, g.enabled, g.secret, g.status, g.last_error, g.updated_at
             FROM grants g JOIN accounts a ON a.id = g.account_id
             WHERE g.kind = ?1
             ORDER BY a.created_at ASC, a.id ASC",
        )?;
        let rows = stmt.query_map(params![kind.as_str()], |row| {
            let username: String = row.get(0)?;
            Ok(grant_from_columns(
                &username,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
            ))
        })?;

        let mut grants = Vec::new();
        for row in rows {
            grants.push(row??);
        }
        Ok(grants)
    }

    /// Open a session for `username` over `kind`
    pub fn record_connect(&self, username: &str, kind: ProtocolKind, client_ip: IpAddr) -> PanelResult<Session> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let id = account_id(&tx, username)?
            .ok_or_else(|| PanelError::NotFound(format!("Account '{}'", username)))?;

        let connected_at = now();
        tx.execute(
            "INSERT INTO sessions (account_id, kind, client_ip, connected_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, kind.as_str(), client_ip.to_string(), timestamp(&connected_at)],
        )?;
        let session_id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(Session {
            id: session_id,
            username: username.to_string(),
            kind,
            client_ip,
            connected_at,
            disconnected_at: None,
        })
    }

    /// Close the oldest open session of `username`, optionally of one kind
    pub fn record_disconnect(&self, username: &str, kind: Option<ProtocolKind>) -> PanelResult<Session> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let id = account_id(&tx, username)?
            .ok_or_else(|| PanelError::NotFound(format!("Account '{}'", username)))?;

        let mut session = tx
            .query_row(
                "SELECT s.id, a.username, s.kind, s.client_ip, s.connected_at, s.disconnected_at
                 FROM sessions s JOIN accounts a ON a.id = s.account_id
                 WHERE s.account_id = ?1 AND s.disconnected_at IS NULL
                   AND (?2 IS NULL OR s.kind = ?2)
                 ORDER BY s.connected_at ASC, s.id ASC LIMIT 1",
                params![id, kind.map(|k| k.as_str())],
                row_to_session,
            )
            .optional()?
            .transpose()?
            .ok_or_else(|| PanelError::NotFound(format!("No open session for '{}'", username)))?;

        let disconnected_at = now();
        tx.execute(
            "UPDATE sessions SET disconnected_at = ?2 WHERE id = ?1",
            params![session.id, timestamp(&disconnected_at)],
        )?;
        tx.commit()?;

        session.disconnected_at = Some(disconnected_at);
        Ok(session)
    }

    /// Sessions still open, optionally of one kind, oldest first
    pub fn open_sessions(&self, kind: Option<ProtocolKind>) -> PanelResult<Vec<Session>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT s.id, a.username, s.kind, s.client_ip, s.connected_at, s.disconnected_at
             FROM sessions s JOIN accounts a ON a.id = s.account_id
             WHERE s.disconnected_at IS NULL AND (?1 IS NULL OR s.kind = ?1)
             ORDER BY s.connected_at ASC, s.id ASC",
        )?;
        let rows = stmt.query_map(params![kind.map(|k| k.as_str())], row_to_session)?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row??);
        }
        Ok(sessions)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> PanelResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PanelError::Store(format!("bad timestamp '{}': {}", s, e)))
}

fn account_id(conn: &Connection, username: &str) -> PanelResult<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT id FROM accounts WHERE username = ?1",
            params![username],
            |row| row.get(0),
        )
        .optional()?)
}

fn query_grant(
    conn: &Connection,
    id: i64,
    username: &str,
    kind: ProtocolKind,
) -> PanelResult<Option<ProtocolGrant>> {
    conn.query_row(
        "SELECT kind, enabled, secret, status, last_error, updated_at
         FROM grants WHERE account_id = ?1 AND kind = ?2",
        params![id, kind.as_str()],
        |row| row_to_grant(row, username),
    )
    .optional()?
    .transpose()
}

/// Rows decode in two steps: rusqlite errors surface from the closure,
/// domain parse errors from the inner result.
fn row_to_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<PanelResult<Account>> {
    let username: String = row.get(0)?;
    let salt: Vec<u8> = row.get(1)?;
    let key: Vec<u8> = row.get(2)?;
    let kdf: String = row.get(3)?;
    let role: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    let last_login: Option<String> = row.get(6)?;

    Ok((|| -> PanelResult<Account> {
        Ok(Account {
            username,
            password: HashedPassword {
                salt,
                key,
                params: KdfParams::decode(&kdf)?,
            },
            role: role.parse()?,
            created_at: parse_timestamp(&created_at)?,
            last_login: last_login.as_deref().map(parse_timestamp).transpose()?,
        })
    })())
}

fn row_to_grant(row: &rusqlite::Row<'_>, username: &str) -> rusqlite::Result<PanelResult<ProtocolGrant>> {
    Ok(grant_from_columns(
        username,
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<PanelResult<Session>> {
    let id: i64 = row.get(0)?;
    let username: String = row.get(1)?;
    let kind: String = row.get(2)?;
    let client_ip: String = row.get(3)?;
    let connected_at: String = row.get(4)?;
    let disconnected_at: Option<String> = row.get(5)?;

    Ok((|| -> PanelResult<Session> {
        Ok(Session {
            id,
            username,
            kind: kind.parse()?,
            client_ip: client_ip
                .parse()
                .map_err(|_| PanelError::Store(format!("bad session address '{}'", client_ip)))?,
            connected_at: parse_timestamp(&connected_at)?,
            disconnected_at: disconnected_at.as_deref().map(parse_timestamp).transpose()?,
        })
    })())
}

fn grant_from_columns(
    username: &str,
    kind: String,
    enabled: bool,
    secret: Option<String>,
    status: String,
    last_error: Option<String>,
    updated_at: String,
) -> PanelResult<ProtocolGrant> {
    Ok(ProtocolGrant {
        username: username.to_string(),
        kind: kind.parse()?,
        enabled,
        secret: secret.as_deref().map(serde_json::from_str).transpose()?,
        status: status.parse()?,
        last_error,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::KdfParams;

    fn hashed() -> HashedPassword {
        HashedPassword {
            salt: vec![1; 16],
            key: vec![2; 32],
            params: KdfParams { memory_kib: 1024, iterations: 1, parallelism: 1 },
        }
    }

    #[test]
    fn test_create_and_get_account() {
        let store = CredentialStore::open_in_memory().unwrap();
        let created = store
            .create_account("alice", &hashed(), &[ProtocolKind::WireGuard, ProtocolKind::Ssh])
            .unwrap();

        let account = store.get_account("alice").unwrap();
        assert_eq!(account.username, "alice");
        assert_eq!(account.password, hashed());
        assert_eq!(account.role, AccountRole::User);
        assert_eq!(account.created_at, created.created_at);
        assert_eq!(account.created_at.timestamp_subsec_nanos() % 1_000, 0);
        assert!(account.last_login.is_none());

        let grants = store.grants("alice").unwrap();
        assert_eq!(grants.len(), 2);
        assert_eq!(grants[0].kind, ProtocolKind::Ssh);
        assert_eq!(grants[1].kind, ProtocolKind::WireGuard);
        assert!(grants.iter().all(|g| g.enabled && g.status == GrantStatus::Pending));
    }

    #[test]
    fn test_duplicate_and_invalid_usernames() {
        let store = CredentialStore::open_in_memory().unwrap();
        store.create_account("alice", &hashed(), &[]).unwrap();

        assert!(matches!(
            store.create_account("alice", &hashed(), &[ProtocolKind::Ssh]),
            Err(PanelError::DuplicateUsername(_))
        ));
        assert!(matches!(
            store.create_account("Bad Name", &hashed(), &[]),
            Err(PanelError::InvalidUsername(_))
        ));
        // The failed duplicate must not have added a grant
        assert!(store.grants("alice").unwrap().is_empty());
    }

    #[test]
    fn test_get_missing_account() {
        let store = CredentialStore::open_in_memory().unwrap();
        assert!(matches!(store.get_account("ghost"), Err(PanelError::NotFound(_))));
        assert!(matches!(
            store.set_grant("ghost", ProtocolKind::Ssh, GrantFields::default()),
            Err(PanelError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_accounts_in_creation_order() {
        let store = CredentialStore::open_in_memory().unwrap();
        for name in ["carol", "alice", "bob"] {
            store.create_account(name, &hashed(), &[]).unwrap();
        }

        let names: Vec<String> = store
            .list_accounts()
            .unwrap()
            .into_iter()
            .map(|a| a.username)
            .collect();
        assert_eq!(names, vec!["carol", "alice", "bob"]);
    }

    #[test]
    fn test_set_grant_partial_updates() {
        let store = CredentialStore::open_in_memory().unwrap();
        store.create_account("alice", &hashed(), &[]).unwrap();

        let grant = store
            .set_grant(
                "alice",
                ProtocolKind::Ikev2Ipsec,
                GrantFields {
                    enabled: Some(true),
                    secret: Some(GrantSecret::Psk { psk: "k".to_string() }),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(grant.enabled);
        assert_eq!(grant.status, GrantStatus::Disabled);

        let grant = store
            .set_grant(
                "alice",
                ProtocolKind::Ikev2Ipsec,
                GrantFields::status(GrantStatus::Failed, Some("reload timed out".to_string())),
            )
            .unwrap();
        assert_eq!(grant.status, GrantStatus::Failed);
        assert_eq!(grant.last_error.as_deref(), Some("reload timed out"));
        assert_eq!(grant.secret, Some(GrantSecret::Psk { psk: "k".to_string() }));

        let grant = store
            .set_grant("alice", ProtocolKind::Ikev2Ipsec, GrantFields::status(GrantStatus::Active, None))
            .unwrap();
        assert!(grant.last_error.is_none());
        assert_eq!(store.grants_of_kind(ProtocolKind::Ikev2Ipsec).unwrap(), vec![grant]);
    }

    #[test]
    fn test_update_account_fields() {
        let store = CredentialStore::open_in_memory().unwrap();
        store.create_account("alice", &hashed(), &[]).unwrap();

        let login = Utc::now();
        store.update_account("alice", AccountUpdate::LastLogin(login)).unwrap();

        let mut new_hash = hashed();
        new_hash.key = vec![9; 32];
        store.update_account("alice", AccountUpdate::Password(new_hash.clone())).unwrap();
        store.update_account("alice", AccountUpdate::Role(AccountRole::Admin)).unwrap();

        let account = store.get_account("alice").unwrap();
        assert_eq!(account.password, new_hash);
        assert_eq!(account.role, AccountRole::Admin);
        assert_eq!(
            account.last_login.map(|t| t.timestamp_micros()),
            Some(login.timestamp_micros())
        );

        assert!(store.update_account("ghost", AccountUpdate::LastLogin(login)).is_err());
    }

    #[test]
    fn test_delete_account_removes_grants() {
        let store = CredentialStore::open_in_memory().unwrap();
        store.create_account("alice", &hashed(), &[ProtocolKind::Ssh]).unwrap();
        store.delete_account("alice").unwrap();

        assert!(store.get_account("alice").is_err());
        assert!(store.grants_of_kind(ProtocolKind::Ssh).unwrap().is_empty());
        assert!(store.delete_account("alice").is_err());
    }

    #[test]
    fn test_grants_of_kind_include_disabled() {
        let store = CredentialStore::open_in_memory().unwrap();
        store.create_account("alice", &hashed(), &[ProtocolKind::WireGuard]).unwrap();
        store.create_account("bob", &hashed(), &[ProtocolKind::WireGuard]).unwrap();
        store
            .set_grant(
                "bob",
                ProtocolKind::WireGuard,
                GrantFields { enabled: Some(false), ..Default::default() },
            )
            .unwrap();

        let grants = store.grants_of_kind(ProtocolKind::WireGuard).unwrap();
        assert_eq!(grants.len(), 2);
        assert_eq!(grants[0].username, "alice");
        assert!(grants[0].enabled);
        assert_eq!(grants[1].username, "bob");
        assert!(!grants[1].enabled);
        assert!(store.grants_of_kind(ProtocolKind::Ssh).unwrap().is_empty());
    }

    #[test]
    fn test_sessions_open_and_close() {
        let store = CredentialStore::open_in_memory().unwrap();
        store.create_account("alice", &hashed(), &[]).unwrap();
        store.create_account("bob", &hashed(), &[]).unwrap();
        let ip: IpAddr = "198.51.100.7".parse().unwrap();

        let first = store.record_connect("alice", ProtocolKind::WireGuard, ip).unwrap();
        store.record_connect("alice", ProtocolKind::Ssh, ip).unwrap();
        store.record_connect("bob", ProtocolKind::WireGuard, ip).unwrap();
        assert!(first.is_open());
        assert_eq!(store.open_sessions(None).unwrap().len(), 3);
        assert_eq!(store.open_sessions(Some(ProtocolKind::WireGuard)).unwrap().len(), 2);

        let closed = store.record_disconnect("alice", Some(ProtocolKind::WireGuard)).unwrap();
        assert_eq!(closed.id, first.id);
        assert!(!closed.is_open());

        let open = store.open_sessions(Some(ProtocolKind::WireGuard)).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].username, "bob");
        assert_eq!(open[0].client_ip, ip);

        assert!(matches!(
            store.record_disconnect("alice", Some(ProtocolKind::WireGuard)),
            Err(PanelError::NotFound(_))
        ));
        assert_eq!(store.record_disconnect("alice", None).unwrap().kind, ProtocolKind::Ssh);
        assert!(store.record_connect("ghost", ProtocolKind::Ssh, ip).is_err());
    }

    #[test]
    fn test_delete_account_removes_sessions() {
        let store = CredentialStore::open_in_memory().unwrap();
        store.create_account("alice", &hashed(), &[]).unwrap();
        store
            .record_connect("alice", ProtocolKind::L2tpIpsec, "10.0.0.9".parse().unwrap())
            .unwrap();
        store.delete_account("alice").unwrap();
        assert!(store.open_sessions(None).unwrap().is_empty());
    }

    #[test]
    fn test_read_only_open_of_missing_store_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("accounts.db");

        let store = CredentialStore::open_read_only(&path).unwrap();
        assert!(store.list_accounts().unwrap().is_empty());
        assert!(!path.exists());
        assert!(!path.parent().unwrap().exists());
    }

    #[test]
    fn test_read_only_open_sees_existing_accounts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.db");
        CredentialStore::open(&path)
            .unwrap()
            .create_account("alice", &hashed(), &[ProtocolKind::Ssh])
            .unwrap();

        let store = CredentialStore::open_read_only(&path).unwrap();
        assert_eq!(store.get_account("alice").unwrap().username, "alice");
        assert!(store.create_account("bob", &hashed(), &[]).is_err());
    }

    #[test]
    fn test_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.db");
        {
            let store = CredentialStore::open(&path).unwrap();
            store.create_account("alice", &hashed(), &[ProtocolKind::Ssh]).unwrap();
        }
        let store = CredentialStore::open(&path).unwrap();
        assert_eq!(store.get_account("alice").unwrap().username, "alice");
    }
}
