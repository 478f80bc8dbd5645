// 🗄️ Store - durable account table on SQLite
//
// Row-level operations take the caller's `Connection`, so they run inside
// whatever database transaction that connection has open. Nothing written
// here is visible to other connections until that transaction commits.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::StoreConfig;
use crate::entities::Account;
use crate::error::Result;
use crate::session::Session;

// ============================================================================
// AUDIT TRAIL
// ============================================================================

/// What happened to an account row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Updated,
    Removed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Updated => "updated",
            EventKind::Removed => "removed",
        }
    }

    fn parse(value: &str) -> Option<EventKind> {
        match value {
            "created" => Some(EventKind::Created),
            "updated" => Some(EventKind::Updated),
            "removed" => Some(EventKind::Removed),
            _ => None,
        }
    }
}

/// One audited change of an account row.
///
/// Written in the same database transaction as the change itself, so a
/// rollback leaves no trace in the trail.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AccountEvent {
    pub event_id: String,
    pub recorded_at: DateTime<Utc>,
    pub kind: EventKind,
    pub account_id: i64,
    /// Values after the change (None for removals)
    pub account_nr: Option<i64>,
    pub balance: Option<i64>,
    /// Session whose flush made the change
    pub session_id: u64,
}

impl AccountEvent {
    fn record(kind: EventKind, account_id: i64, values: Option<&Account>, session_id: u64) -> Self {
        AccountEvent {
            event_id: uuid::Uuid::new_v4().to_string(),
            recorded_at: Utc::now(),
            kind,
            account_id,
            account_nr: values.map(|a| a.account_nr),
            balance: values.map(|a| a.balance),
            session_id,
        }
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection, config: &StoreConfig) -> Result<()> {
    if config.wal {
        // Readers keep seeing committed data while one session writes
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(journal_mode = %mode, "journal mode set");
    }

    conn.execute(
        "CREATE TABLE IF NOT EXISTS accounts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_nr INTEGER NOT NULL,
            balance INTEGER NOT NULL DEFAULT 0,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS account_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            recorded_at TEXT NOT NULL,
            kind TEXT NOT NULL,
            account_id INTEGER NOT NULL,
            account_nr INTEGER,
            balance INTEGER,
            session_id INTEGER NOT NULL
        )",
        [],
    )?;

    if config.unique_account_nr {
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_accounts_account_nr_unique
             ON accounts(account_nr)",
            [],
        )?;
    } else {
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_accounts_account_nr ON accounts(account_nr)",
            [],
        )?;
    }

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_account_events_account ON account_events(account_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// ACCOUNT ROWS
// ============================================================================
//
// `audit` is the id of the session making the change; None skips the trail.

fn account_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: Some(row.get(0)?),
        account_nr: row.get(1)?,
        balance: row.get(2)?,
    })
}

/// Insert a new row and return the id the store generated.
/// Any id on `account` is ignored.
pub fn insert_account(conn: &Connection, account: &Account, audit: Option<u64>) -> Result<i64> {
    conn.execute(
        "INSERT INTO accounts (account_nr, balance) VALUES (?1, ?2)",
        params![account.account_nr, account.balance],
    )?;
    let id = conn.last_insert_rowid();

    if let Some(session_id) = audit {
        insert_event(
            conn,
            &AccountEvent::record(EventKind::Created, id, Some(account), session_id),
        )?;
    }

    Ok(id)
}

/// Overwrite the row's values. Returns the number of rows touched (0 or 1).
pub fn update_account(
    conn: &Connection,
    id: i64,
    account: &Account,
    audit: Option<u64>,
) -> Result<usize> {
    let changed = conn.execute(
        "UPDATE accounts SET account_nr = ?1, balance = ?2 WHERE id = ?3",
        params![account.account_nr, account.balance, id],
    )?;

    if let (Some(session_id), true) = (audit, changed > 0) {
        insert_event(
            conn,
            &AccountEvent::record(EventKind::Updated, id, Some(account), session_id),
        )?;
    }

    Ok(changed)
}

/// Delete the row. Returns the number of rows touched (0 or 1).
pub fn delete_account(conn: &Connection, id: i64, audit: Option<u64>) -> Result<usize> {
    let changed = conn.execute("DELETE FROM accounts WHERE id = ?1", params![id])?;

    if let (Some(session_id), true) = (audit, changed > 0) {
        insert_event(
            conn,
            &AccountEvent::record(EventKind::Removed, id, None, session_id),
        )?;
    }

    Ok(changed)
}

pub fn get_account(conn: &Connection, id: i64) -> Result<Option<Account>> {
    let account = conn
        .query_row(
            "SELECT id, account_nr, balance FROM accounts WHERE id = ?1",
            params![id],
            account_from_row,
        )
        .optional()?;

    Ok(account)
}

pub fn get_all_accounts(conn: &Connection) -> Result<Vec<Account>> {
    let mut stmt = conn.prepare("SELECT id, account_nr, balance FROM accounts ORDER BY id")?;

    let accounts = stmt
        .query_map([], account_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(accounts)
}

pub fn get_accounts_by_number(conn: &Connection, account_nr: i64) -> Result<Vec<Account>> {
    let mut stmt = conn.prepare(
        "SELECT id, account_nr, balance FROM accounts WHERE account_nr = ?1 ORDER BY id",
    )?;

    let accounts = stmt
        .query_map(params![account_nr], account_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(accounts)
}

pub fn count_accounts(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))?;

    Ok(count)
}

// ============================================================================
// EVENT ROWS
// ============================================================================

fn insert_event(conn: &Connection, event: &AccountEvent) -> Result<()> {
    conn.execute(
        "INSERT INTO account_events (
            event_id, recorded_at, kind, account_id, account_nr, balance, session_id
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.recorded_at.to_rfc3339(),
            event.kind.as_str(),
            event.account_id,
            event.account_nr,
            event.balance,
            event.session_id as i64,
        ],
    )?;

    Ok(())
}

fn text_conversion_error<E>(column: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}

#[derive(Debug)]
struct UnknownEventKind(String);

impl std::fmt::Display for UnknownEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown event kind '{}'", self.0)
    }
}

impl std::error::Error for UnknownEventKind {}

/// Audit trail of one account, oldest first
pub fn get_account_events(conn: &Connection, account_id: i64) -> Result<Vec<AccountEvent>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, recorded_at, kind, account_id, account_nr, balance, session_id
         FROM account_events
         WHERE account_id = ?1
         ORDER BY id ASC",
    )?;

    let events = stmt
        .query_map(params![account_id], |row| {
            let recorded_at: String = row.get(1)?;
            let kind: String = row.get(2)?;
            let session_id: i64 = row.get(6)?;

            Ok(AccountEvent {
                event_id: row.get(0)?,
                recorded_at: DateTime::parse_from_rfc3339(&recorded_at)
                    .map_err(|e| text_conversion_error(1, e))?
                    .with_timezone(&Utc),
                kind: EventKind::parse(&kind)
                    .ok_or_else(|| text_conversion_error(2, UnknownEventKind(kind.clone())))?,
                account_id: row.get(3)?,
                account_nr: row.get(4)?,
                balance: row.get(5)?,
                session_id: session_id as u64,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(events)
}

// ============================================================================
// STORE HANDLE
// ============================================================================

/// Explicitly constructed handle to one account database.
///
/// Cheap to clone and safe to share across threads; each session it opens
/// gets its own connection.
#[derive(Clone)]
pub struct Store {
    config: Arc<StoreConfig>,
}

impl Store {
    /// Open (and if needed create) the database described by `config`
    pub fn open(config: StoreConfig) -> Result<Store> {
        config.validate()?;

        let store = Store {
            config: Arc::new(config),
        };

        let conn = store.connect()?;
        setup_database(&conn, &store.config)?;

        tracing::info!(path = %store.config.database_path.display(), "store opened");
        Ok(store)
    }

    /// New connection to the store's database
    pub fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.config.database_path)?;
        conn.busy_timeout(self.config.busy_timeout())?;
        Ok(conn)
    }

    /// Start a new unit of work
    pub fn open_session(&self) -> Result<Session> {
        let conn = self.connect()?;
        Ok(Session::new(conn, (*self.config).clone()))
    }

    /// Committed row count
    pub fn count(&self) -> Result<i64> {
        count_accounts(&self.connect()?)
    }

    /// Committed audit events for one account
    pub fn events_for_account(&self, id: i64) -> Result<Vec<AccountEvent>> {
        get_account_events(&self.connect()?, id)
    }

    /// Delete every account and event row
    pub fn clean(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            "BEGIN IMMEDIATE;
             DELETE FROM accounts;
             DELETE FROM account_events;
             COMMIT;",
        )?;

        tracing::debug!("store cleaned");
        Ok(())
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("database_path", &self.config.database_path)
            .finish()
    }
}
