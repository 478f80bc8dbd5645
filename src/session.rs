// 🧠 Session - identity map + change log for one unit of work
//
// Guarantees:
// - One in-memory instance per id for the session's lifetime (until clear,
//   rollback or close)
// - Mutations of managed instances are captured without a save call:
//   snapshot at attach, diff at flush
// - The database transaction is opened lazily by the first flush that has
//   work, so a session that only reads always sees committed data

use rusqlite::Connection;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::{FlushMode, PresetIdPolicy, StoreConfig};
use crate::db;
use crate::entities::{Account, AccountRef};
use crate::error::{PersistenceError, Result};

/// Session ids are unique per process, so an instance attached in one store
/// is never mistaken for one managed by a session of another store.
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// ENTRY STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Managed,
    /// remove() called, row still present
    Removed,
    /// Row deleted by a flush of the open transaction
    Deleted,
}

/// One identity map slot
struct Entry {
    instance: AccountRef,
    /// Values last synchronised with the store
    snapshot: Account,
    state: EntryState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Idle,
    /// Logical transaction open; `db_open` once a flush issued BEGIN
    Active { db_open: bool },
}

// ============================================================================
// SESSION
// ============================================================================

/// Unit of work over one store connection.
///
/// Not thread-safe: instances are `Rc`-shared handles and the session must
/// stay with a single caller.
pub struct Session {
    id: u64,
    conn: Connection,
    config: StoreConfig,
    identity_map: BTreeMap<i64, Entry>,
    /// Registered instances awaiting their first flush, in registration order
    pending_inserts: Vec<AccountRef>,
    tx: TxState,
}

impl Session {
    pub(crate) fn new(conn: Connection, config: StoreConfig) -> Self {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(session = id, "session opened");
        Session {
            id,
            conn,
            config,
            identity_map: BTreeMap::new(),
            pending_inserts: Vec::new(),
            tx: TxState::Idle,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Is a transaction scope open?
    pub fn is_active(&self) -> bool {
        matches!(self.tx, TxState::Active { .. })
    }

    // ========================================================================
    // TRANSACTION SCOPE
    // ========================================================================

    pub fn begin(&mut self) -> Result<()> {
        if self.is_active() {
            return Err(PersistenceError::IllegalState(
                "transaction already active".to_string(),
            ));
        }
        self.tx = TxState::Active { db_open: false };

        tracing::debug!(session = self.id, "transaction begun");
        Ok(())
    }

    /// Flush, then make everything durable. The identity map survives; removed
    /// instances are evicted and detached.
    ///
    /// On error the transaction stays open; the caller decides on rollback.
    pub fn commit(&mut self) -> Result<()> {
        self.require_active("commit")?;
        self.flush()?;

        if self.tx == (TxState::Active { db_open: true }) {
            self.conn.execute_batch("COMMIT")?;
        }
        self.tx = TxState::Idle;

        let deleted: Vec<i64> = self
            .identity_map
            .iter()
            .filter(|(_, entry)| entry.state == EntryState::Deleted)
            .map(|(id, _)| *id)
            .collect();
        for id in &deleted {
            if let Some(entry) = self.identity_map.remove(id) {
                entry.instance.detach();
            }
        }

        tracing::debug!(
            session = self.id,
            managed = self.identity_map.len(),
            evicted = deleted.len(),
            "transaction committed"
        );
        Ok(())
    }

    /// Undo the transaction: pending changes are discarded, flushed rows are
    /// rolled back and every instance is detached. In-memory values (ids
    /// assigned by an undone flush included) are left as they are.
    pub fn rollback(&mut self) -> Result<()> {
        self.require_active("rollback")?;

        let result = self.rollback_database();
        self.tx = TxState::Idle;
        self.detach_all();

        tracing::debug!(session = self.id, "transaction rolled back");
        result
    }

    /// Close the session: roll back any open database transaction and detach
    /// every instance.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    // ========================================================================
    // ENTITY OPERATIONS
    // ========================================================================

    /// Schedule a new account for insertion ("persist"). No store access.
    pub fn register(&mut self, account: &AccountRef) -> Result<()> {
        self.ensure_not_foreign(account)?;

        if self.pending_position(account).is_some() {
            return Ok(());
        }

        if let Some(entry) = self
            .identity_map
            .values_mut()
            .find(|entry| entry.instance.same(account))
        {
            return match entry.state {
                EntryState::Managed => Ok(()),
                EntryState::Removed => {
                    entry.state = EntryState::Managed;
                    Ok(())
                }
                EntryState::Deleted => Err(PersistenceError::IllegalState(format!(
                    "account {:?} was already deleted in this transaction",
                    account.id()
                ))),
            };
        }

        account.attach(self.id);
        self.pending_inserts.push(account.clone());

        tracing::debug!(
            session = self.id,
            account_nr = account.account_nr(),
            "account registered"
        );
        Ok(())
    }

    /// Look up by id: the managed instance if there is one, otherwise the
    /// stored row, attached as a new managed instance.
    pub fn find(&mut self, id: i64) -> Result<Option<AccountRef>> {
        if let Some(entry) = self.identity_map.get(&id) {
            return Ok(match entry.state {
                EntryState::Managed => Some(entry.instance.clone()),
                EntryState::Removed | EntryState::Deleted => None,
            });
        }

        match db::get_account(&self.conn, id)? {
            Some(account) => Ok(Some(self.attach_loaded(id, account))),
            None => Ok(None),
        }
    }

    /// All stored accounts, resolved through the identity map
    pub fn find_all(&mut self) -> Result<Vec<AccountRef>> {
        self.auto_flush()?;
        let rows = db::get_all_accounts(&self.conn)?;
        Ok(self.resolve_rows(rows))
    }

    /// Stored accounts with the given number, resolved through the identity map
    pub fn find_by_account_nr(&mut self, account_nr: i64) -> Result<Vec<AccountRef>> {
        self.auto_flush()?;
        let rows = db::get_accounts_by_number(&self.conn, account_nr)?;
        Ok(self.resolve_rows(rows))
    }

    /// Stored row count (as seen by this session's transaction)
    pub fn count(&mut self) -> Result<i64> {
        self.auto_flush()?;
        db::count_accounts(&self.conn)
    }

    /// Apply pending inserts, updates and deletes inside the database
    /// transaction without committing it.
    pub fn flush(&mut self) -> Result<()> {
        self.require_active("flush")?;

        if !self.has_pending_changes() {
            return Ok(());
        }
        self.ensure_database_transaction()?;

        // Events are attributed to this session
        let audit = self.config.audit_events.then_some(self.id);
        let (inserted, updated, deleted) = (
            self.flush_inserts(audit)?,
            self.flush_updates(audit)?,
            self.flush_deletes(audit)?,
        );

        tracing::debug!(
            session = self.id,
            inserted,
            updated,
            deleted,
            "session flushed"
        );
        Ok(())
    }

    /// Reconcile `account` into this session and return the managed instance
    /// for its id. An already-managed instance wins: the argument's values
    /// are copied onto it and the argument itself stays detached.
    pub fn merge(&mut self, account: &AccountRef) -> Result<AccountRef> {
        if account.session_id() == Some(self.id) {
            if self.pending_position(account).is_some() {
                return Ok(account.clone());
            }
            if let Some(entry) = self
                .identity_map
                .values()
                .find(|entry| entry.instance.same(account))
            {
                return match entry.state {
                    EntryState::Managed => Ok(account.clone()),
                    EntryState::Removed | EntryState::Deleted => {
                        Err(PersistenceError::IllegalState(
                            "cannot merge a removed account".to_string(),
                        ))
                    }
                };
            }
        }

        let source = account.snapshot();

        if let Some(id) = source.id {
            if let Some(entry) = self.identity_map.get(&id) {
                if entry.state != EntryState::Managed {
                    return Err(PersistenceError::IllegalState(format!(
                        "cannot merge onto removed account {}",
                        id
                    )));
                }
                entry.instance.borrow_mut().copy_state_from(&source);
                return Ok(entry.instance.clone());
            }

            if let Some(row) = db::get_account(&self.conn, id)? {
                let instance = self.attach_loaded(id, row);
                instance.borrow_mut().copy_state_from(&source);
                return Ok(instance);
            }
        }

        // Nothing stored under that id: the copy becomes a new account
        let instance = AccountRef::new(source);
        instance.attach(self.id);
        self.pending_inserts.push(instance.clone());

        tracing::debug!(session = self.id, "merge scheduled a new account");
        Ok(instance)
    }

    /// Detach everything. The transaction scope, if any, stays open.
    pub fn clear(&mut self) {
        self.detach_all();
        tracing::debug!(session = self.id, "session cleared");
    }

    /// Mark a managed account for deletion. Its id is left untouched.
    pub fn remove(&mut self, account: &AccountRef) -> Result<()> {
        if account.session_id() != Some(self.id) {
            return Err(PersistenceError::IllegalState(
                "cannot remove an account that is not managed by this session".to_string(),
            ));
        }

        if let Some(position) = self.pending_position(account) {
            let dropped = self.pending_inserts.remove(position);
            dropped.detach();
            return Ok(());
        }

        match self
            .identity_map
            .values_mut()
            .find(|entry| entry.instance.same(account))
        {
            Some(entry) => {
                if entry.state == EntryState::Managed {
                    entry.state = EntryState::Removed;
                    tracing::debug!(session = self.id, id = ?account.id(), "account removed");
                }
                Ok(())
            }
            None => Err(PersistenceError::IllegalState(
                "cannot remove an account that is not managed by this session".to_string(),
            )),
        }
    }

    /// Drop in-memory changes and reload the account from the store
    pub fn refresh(&mut self, account: &AccountRef) -> Result<()> {
        let id = self.managed_key(account).ok_or_else(|| {
            PersistenceError::IllegalState(
                "cannot refresh an account that is not managed by this session".to_string(),
            )
        })?;

        let row = db::get_account(&self.conn, id)?
            .ok_or_else(|| PersistenceError::NotFound(format!("account {} no longer exists", id)))?;

        if let Some(entry) = self.identity_map.get_mut(&id) {
            entry.instance.replace(row.clone());
            entry.snapshot = row;
        }

        tracing::debug!(session = self.id, id, "account refreshed");
        Ok(())
    }

    /// Is this exact instance managed (or pending insert) here?
    pub fn contains(&self, account: &AccountRef) -> bool {
        if account.session_id() != Some(self.id) {
            return false;
        }
        self.pending_position(account).is_some() || self.managed_key(account).is_some()
    }

    /// Anything a flush would write?
    pub fn has_pending_changes(&self) -> bool {
        !self.pending_inserts.is_empty()
            || self.identity_map.values().any(|entry| match entry.state {
                EntryState::Managed => *entry.instance.borrow() != entry.snapshot,
                EntryState::Removed => true,
                EntryState::Deleted => false,
            })
    }

    // ========================================================================
    // FLUSH STEPS
    // ========================================================================

    fn flush_inserts(&mut self, audit: Option<u64>) -> Result<usize> {
        let mut inserted = 0;

        // Insert one at a time so a failure leaves the rest pending
        while let Some(instance) = self.pending_inserts.first().cloned() {
            let mut account = instance.snapshot();

            if let Some(preset) = account.id {
                match self.config.preset_id_policy {
                    PresetIdPolicy::Reject => {
                        return Err(PersistenceError::ConstraintViolation(format!(
                            "new account {} carries preset id {}",
                            account.account_nr, preset
                        )));
                    }
                    PresetIdPolicy::Overwrite => {
                        tracing::debug!(preset, "preset id overwritten by generated id");
                    }
                }
            }

            let id = db::insert_account(&self.conn, &account, audit)?;
            account.id = Some(id);
            instance.set_id(Some(id));

            self.pending_inserts.remove(0);
            self.identity_map.insert(
                id,
                Entry {
                    instance,
                    snapshot: account,
                    state: EntryState::Managed,
                },
            );
            inserted += 1;
        }

        Ok(inserted)
    }

    fn flush_updates(&mut self, audit: Option<u64>) -> Result<usize> {
        let mut updated = 0;

        for (id, entry) in self.identity_map.iter_mut() {
            if entry.state != EntryState::Managed {
                continue;
            }

            let current = entry.instance.snapshot();
            if current == entry.snapshot {
                continue;
            }
            if current.id != Some(*id) {
                return Err(PersistenceError::IllegalState(format!(
                    "identifier of managed account {} was changed to {:?}",
                    id, current.id
                )));
            }

            if db::update_account(&self.conn, *id, &current, audit)? == 0 {
                return Err(PersistenceError::Concurrency(format!(
                    "account {} was deleted by another session",
                    id
                )));
            }
            entry.snapshot = current;
            updated += 1;
        }

        Ok(updated)
    }

    fn flush_deletes(&mut self, audit: Option<u64>) -> Result<usize> {
        let mut deleted = 0;

        for (id, entry) in self.identity_map.iter_mut() {
            if entry.state != EntryState::Removed {
                continue;
            }

            if db::delete_account(&self.conn, *id, audit)? == 0 {
                return Err(PersistenceError::Concurrency(format!(
                    "account {} was already deleted by another session",
                    id
                )));
            }
            entry.state = EntryState::Deleted;
            deleted += 1;
        }

        Ok(deleted)
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    fn require_active(&self, operation: &str) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(PersistenceError::IllegalState(format!(
                "{} requires an active transaction",
                operation
            )))
        }
    }

    fn ensure_not_foreign(&self, account: &AccountRef) -> Result<()> {
        match account.session_id() {
            Some(owner) if owner != self.id => Err(PersistenceError::IllegalState(format!(
                "account is attached to session {}",
                owner
            ))),
            _ => Ok(()),
        }
    }

    fn ensure_database_transaction(&mut self) -> Result<()> {
        if self.tx == (TxState::Active { db_open: false }) {
            // IMMEDIATE takes the write lock now; a busy store fails here
            self.conn.execute_batch("BEGIN IMMEDIATE")?;
            self.tx = TxState::Active { db_open: true };
        }
        Ok(())
    }

    fn rollback_database(&mut self) -> Result<()> {
        // SQLite may already have rolled back on its own after some errors
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    fn auto_flush(&mut self) -> Result<()> {
        if self.config.flush_mode == FlushMode::Auto && self.is_active() {
            self.flush()?;
        }
        Ok(())
    }

    fn pending_position(&self, account: &AccountRef) -> Option<usize> {
        self.pending_inserts
            .iter()
            .position(|pending| pending.same(account))
    }

    /// Identity map key of `account` if it is managed and not removed
    fn managed_key(&self, account: &AccountRef) -> Option<i64> {
        self.identity_map
            .iter()
            .find(|(_, entry)| entry.instance.same(account))
            .filter(|(_, entry)| entry.state == EntryState::Managed)
            .map(|(id, _)| *id)
    }

    fn attach_loaded(&mut self, id: i64, account: Account) -> AccountRef {
        let instance = AccountRef::new(account.clone());
        instance.attach(self.id);
        self.identity_map.insert(
            id,
            Entry {
                instance: instance.clone(),
                snapshot: account,
                state: EntryState::Managed,
            },
        );
        instance
    }

    fn resolve_rows(&mut self, rows: Vec<Account>) -> Vec<AccountRef> {
        let mut resolved = Vec::with_capacity(rows.len());

        for row in rows {
            let Some(id) = row.id else { continue };
            if let Some(entry) = self.identity_map.get(&id) {
                // Managed instances win over the row; removed ones are hidden
                if entry.state == EntryState::Managed {
                    resolved.push(entry.instance.clone());
                }
                continue;
            }
            resolved.push(self.attach_loaded(id, row));
        }

        resolved
    }

    fn detach_all(&mut self) {
        for instance in self.pending_inserts.drain(..) {
            instance.detach();
        }
        for (_, entry) in std::mem::take(&mut self.identity_map) {
            entry.instance.detach();
        }
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.is_active() {
            tracing::warn!(
                session = self.id,
                "session closed with an active transaction, rolling back"
            );
        }
        let result = self.rollback_database();
        self.tx = TxState::Idle;
        self.detach_all();
        result
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(session = self.id, error = %e, "rollback on session drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{EventKind, Store};

    fn test_store_with(config: impl FnOnce(&mut StoreConfig)) -> (tempfile::TempDir, Store) {
        crate::logging::init_test();
        let dir = tempfile::tempdir().unwrap();
        let mut store_config = StoreConfig::with_path(dir.path().join("bank.db"));
        config(&mut store_config);
        let store = Store::open(store_config).unwrap();
        (dir, store)
    }

    fn test_store() -> (tempfile::TempDir, Store) {
        test_store_with(|_| {})
    }

    fn new_account(account_nr: i64) -> AccountRef {
        AccountRef::new(Account::new(account_nr))
    }

    #[test]
    fn test_double_begin_is_illegal() {
        let (_dir, store) = test_store();
        let mut session = store.open_session().unwrap();

        session.begin().unwrap();
        let err = session.begin().unwrap_err();

        assert!(matches!(err, PersistenceError::IllegalState(_)));
        assert!(session.is_active());
    }

    #[test]
    fn test_flush_commit_rollback_require_transaction() {
        let (_dir, store) = test_store();
        let mut session = store.open_session().unwrap();

        assert!(matches!(session.flush(), Err(PersistenceError::IllegalState(_))));
        assert!(matches!(session.commit(), Err(PersistenceError::IllegalState(_))));
        assert!(matches!(session.rollback(), Err(PersistenceError::IllegalState(_))));
    }

    #[test]
    fn test_register_does_not_touch_store() {
        let (_dir, store) = test_store();
        let mut session = store.open_session().unwrap();
        let account = new_account(112);

        session.begin().unwrap();
        session.register(&account).unwrap();

        assert_eq!(account.id(), None);
        assert!(session.contains(&account));
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_register_twice_is_idempotent() {
        let (_dir, store) = test_store();
        let mut session = store.open_session().unwrap();
        let account = new_account(112);

        session.begin().unwrap();
        session.register(&account).unwrap();
        session.register(&account).unwrap();
        session.commit().unwrap();

        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_register_instance_of_other_session_fails() {
        let (_dir, store) = test_store();
        let mut first = store.open_session().unwrap();
        let mut second = store.open_session().unwrap();
        let account = new_account(112);

        first.register(&account).unwrap();
        let err = second.register(&account).unwrap_err();

        assert!(matches!(err, PersistenceError::IllegalState(_)));
        assert!(!second.contains(&account));
    }

    #[test]
    fn test_instance_of_session_in_other_store_is_foreign() {
        let (_dir_a, store_a) = test_store();
        let (_dir_b, store_b) = test_store();
        let mut sa = store_a.open_session().unwrap();
        let mut sb = store_b.open_session().unwrap();
        let account = new_account(112);

        sa.register(&account).unwrap();
        assert_ne!(sa.id(), sb.id());

        let err = sb.register(&account).unwrap_err();
        assert!(matches!(err, PersistenceError::IllegalState(_)));
        assert!(!sb.contains(&account));
        assert!(matches!(sb.remove(&account), Err(PersistenceError::IllegalState(_))));
    }

    #[test]
    fn test_register_of_deleted_instance_fails() {
        let (_dir, store) = test_store();
        let mut session = store.open_session().unwrap();
        let account = new_account(5);

        session.begin().unwrap();
        session.register(&account).unwrap();
        session.commit().unwrap();

        session.begin().unwrap();
        session.remove(&account).unwrap();
        session.flush().unwrap();

        let err = session.register(&account).unwrap_err();
        assert!(matches!(err, PersistenceError::IllegalState(_)));

        session.commit().unwrap();
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_mutation_before_flush_is_inserted() {
        let (_dir, store) = test_store();
        let mut session = store.open_session().unwrap();
        let account = new_account(114);

        session.begin().unwrap();
        session.register(&account).unwrap();
        account.set_balance(400);
        session.commit().unwrap();

        let id = account.id().unwrap();
        let conn = store.connect().unwrap();
        assert_eq!(db::get_account(&conn, id).unwrap().unwrap().balance, 400);
    }

    #[test]
    fn test_clean_instance_is_not_updated() {
        let (_dir, store) = test_store();
        let mut session = store.open_session().unwrap();
        let account = new_account(1);

        session.begin().unwrap();
        session.register(&account).unwrap();
        session.commit().unwrap();
        let id = account.id().unwrap();

        session.begin().unwrap();
        assert!(!session.has_pending_changes());
        session.commit().unwrap();

        account.set_balance(10);
        assert!(session.has_pending_changes());
        session.begin().unwrap();
        session.commit().unwrap();

        let events = store.events_for_account(id).unwrap();
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Created, EventKind::Updated]);
        assert!(events.iter().all(|e| e.session_id == session.id()));
    }

    #[test]
    fn test_remove_pending_insert_drops_it() {
        let (_dir, store) = test_store();
        let mut session = store.open_session().unwrap();
        let account = new_account(5);

        session.begin().unwrap();
        session.register(&account).unwrap();
        session.remove(&account).unwrap();
        session.commit().unwrap();

        assert!(!account.is_attached());
        assert_eq!(account.id(), None);
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_remove_detached_instance_fails() {
        let (_dir, store) = test_store();
        let mut session = store.open_session().unwrap();

        let err = session.remove(&new_account(5)).unwrap_err();
        assert!(matches!(err, PersistenceError::IllegalState(_)));
    }

    #[test]
    fn test_register_after_remove_cancels_removal() {
        let (_dir, store) = test_store();
        let mut session = store.open_session().unwrap();
        let account = new_account(5);

        session.begin().unwrap();
        session.register(&account).unwrap();
        session.commit().unwrap();

        session.remove(&account).unwrap();
        assert!(!session.contains(&account));
        session.register(&account).unwrap();
        assert!(session.contains(&account));

        session.begin().unwrap();
        session.commit().unwrap();
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_reject_policy_refuses_preset_id() {
        let (_dir, store) = test_store_with(|c| c.preset_id_policy = PresetIdPolicy::Reject);
        let mut session = store.open_session().unwrap();
        let account = new_account(111);
        account.set_id(Some(-100));

        session.begin().unwrap();
        session.register(&account).unwrap();
        let err = session.flush().unwrap_err();

        assert!(matches!(err, PersistenceError::ConstraintViolation(_)));
        assert_eq!(account.id(), Some(-100));
        session.rollback().unwrap();
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_merge_transient_schedules_insert() {
        let (_dir, store) = test_store();
        let mut session = store.open_session().unwrap();
        let transient = AccountRef::new(Account::new(9).with_balance(30));

        session.begin().unwrap();
        let managed = session.merge(&transient).unwrap();

        assert!(!managed.same(&transient));
        assert!(session.contains(&managed));
        assert!(!session.contains(&transient));

        session.commit().unwrap();
        assert!(managed.id().is_some());
        assert_eq!(transient.id(), None);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_merge_detached_loads_and_copies() {
        let (_dir, store) = test_store();
        let account = new_account(3);
        {
            let mut writer = store.open_session().unwrap();
            writer.begin().unwrap();
            writer.register(&account).unwrap();
            writer.commit().unwrap();
            writer.close().unwrap();
        }
        assert!(!account.is_attached());
        account.set_balance(75);

        let mut session = store.open_session().unwrap();
        session.begin().unwrap();
        let managed = session.merge(&account).unwrap();
        assert!(!managed.same(&account));
        assert_eq!(managed.balance(), 75);
        assert!(session.has_pending_changes());
        session.commit().unwrap();

        let mut reader = store.open_session().unwrap();
        let found = reader.find(account.id().unwrap()).unwrap().unwrap();
        assert_eq!(found.balance(), 75);
    }

    #[test]
    fn test_merge_onto_removed_fails() {
        let (_dir, store) = test_store();
        let mut session = store.open_session().unwrap();
        let account = new_account(3);

        session.begin().unwrap();
        session.register(&account).unwrap();
        session.commit().unwrap();
        session.remove(&account).unwrap();

        let copy = account.detached_copy();
        assert!(matches!(session.merge(&copy), Err(PersistenceError::IllegalState(_))));
        assert!(matches!(session.merge(&account), Err(PersistenceError::IllegalState(_))));
    }

    #[test]
    fn test_refresh_requires_managed_instance() {
        let (_dir, store) = test_store();
        let mut session = store.open_session().unwrap();

        let err = session.refresh(&new_account(1)).unwrap_err();
        assert!(matches!(err, PersistenceError::IllegalState(_)));
    }

    #[test]
    fn test_refresh_sees_own_flushed_write() {
        let (_dir, store) = test_store();
        let mut session = store.open_session().unwrap();
        let account = new_account(1);

        session.begin().unwrap();
        session.register(&account).unwrap();
        account.set_balance(40);
        session.flush().unwrap();

        account.set_balance(999);
        session.refresh(&account).unwrap();

        assert_eq!(account.balance(), 40);
        assert!(!session.has_pending_changes());
        assert_eq!(store.count().unwrap(), 0);
        session.commit().unwrap();
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_refresh_of_deleted_row_is_not_found() {
        let (_dir, store) = test_store();
        let mut session = store.open_session().unwrap();
        let account = new_account(1);
        session.begin().unwrap();
        session.register(&account).unwrap();
        session.commit().unwrap();
        let id = account.id().unwrap();

        let mut other = store.open_session().unwrap();
        let theirs = other.find(id).unwrap().unwrap();
        other.begin().unwrap();
        other.remove(&theirs).unwrap();
        other.commit().unwrap();

        let err = session.refresh(&account).unwrap_err();
        assert!(matches!(err, PersistenceError::NotFound(_)));
    }

    #[test]
    fn test_update_of_row_deleted_elsewhere_is_concurrency_error() {
        let (_dir, store) = test_store();
        let mut session = store.open_session().unwrap();
        let account = new_account(1);
        session.begin().unwrap();
        session.register(&account).unwrap();
        session.commit().unwrap();
        let id = account.id().unwrap();

        let mut other = store.open_session().unwrap();
        let theirs = other.find(id).unwrap().unwrap();
        other.begin().unwrap();
        other.remove(&theirs).unwrap();
        other.commit().unwrap();

        account.set_balance(99);
        session.begin().unwrap();
        let err = session.commit().unwrap_err();
        assert!(matches!(err, PersistenceError::Concurrency(_)));
        assert!(session.is_active());
        session.rollback().unwrap();
    }

    #[test]
    fn test_second_writer_gets_concurrency_error() {
        let (_dir, store) = test_store_with(|c| c.busy_timeout_ms = 0);
        let mut first = store.open_session().unwrap();
        let mut second = store.open_session().unwrap();

        first.begin().unwrap();
        first.register(&new_account(1)).unwrap();
        first.flush().unwrap();

        second.begin().unwrap();
        second.register(&new_account(2)).unwrap();
        let err = second.flush().unwrap_err();
        assert!(matches!(err, PersistenceError::Concurrency(_)));

        second.rollback().unwrap();
        first.commit().unwrap();
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_uncommitted_rows_are_invisible_to_other_sessions() {
        let (_dir, store) = test_store();
        let mut writer = store.open_session().unwrap();
        let mut reader = store.open_session().unwrap();
        let account = new_account(1);

        writer.begin().unwrap();
        writer.register(&account).unwrap();
        writer.flush().unwrap();
        let id = account.id().unwrap();

        assert!(reader.find(id).unwrap().is_none());
        assert!(writer.find(id).unwrap().unwrap().same(&account));

        writer.commit().unwrap();
        assert!(reader.find(id).unwrap().is_some());
    }

    #[test]
    fn test_find_all_resolves_through_identity_map() {
        let (_dir, store) = test_store();
        let mut session = store.open_session().unwrap();
        let first = new_account(1);
        let second = new_account(2);

        session.begin().unwrap();
        session.register(&first).unwrap();
        session.register(&second).unwrap();
        session.commit().unwrap();

        let all = session.find_all().unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].same(&first));
        assert!(all[1].same(&second));

        session.remove(&first).unwrap();
        let remaining = session.find_all().unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].same(&second));
    }

    #[test]
    fn test_auto_flush_mode_makes_queries_see_pending_inserts() {
        let (_dir, store) = test_store();
        let mut session = store.open_session().unwrap();
        let account = new_account(42);

        session.begin().unwrap();
        session.register(&account).unwrap();
        let found = session.find_by_account_nr(42).unwrap();

        assert_eq!(found.len(), 1);
        assert!(found[0].same(&account));
        session.rollback().unwrap();
    }

    #[test]
    fn test_commit_flush_mode_keeps_queries_on_store_state() {
        let (_dir, store) = test_store_with(|c| c.flush_mode = FlushMode::Commit);
        let mut session = store.open_session().unwrap();

        session.begin().unwrap();
        session.register(&new_account(42)).unwrap();

        assert!(session.find_by_account_nr(42).unwrap().is_empty());
        assert_eq!(session.count().unwrap(), 0);

        session.commit().unwrap();
        assert_eq!(session.count().unwrap(), 1);
    }

    #[test]
    fn test_clear_after_flush_keeps_transaction_open() {
        let (_dir, store) = test_store();
        let mut session = store.open_session().unwrap();
        let account = new_account(7);

        session.begin().unwrap();
        session.register(&account).unwrap();
        session.flush().unwrap();
        let id = account.id().unwrap();

        session.clear();
        assert!(session.is_active());
        assert!(!account.is_attached());

        session.commit().unwrap();
        assert_eq!(store.count().unwrap(), 1);

        let found = session.find(id).unwrap().unwrap();
        assert!(!found.same(&account));
        assert_eq!(found.account_nr(), 7);
    }

    #[test]
    fn test_close_detaches_and_rolls_back() {
        let (_dir, store) = test_store();
        let mut session = store.open_session().unwrap();
        let account = new_account(1);

        session.begin().unwrap();
        session.register(&account).unwrap();
        session.flush().unwrap();
        session.close().unwrap();

        assert!(!account.is_attached());
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_drop_detaches_instances() {
        let (_dir, store) = test_store();
        let account = new_account(1);
        {
            let mut session = store.open_session().unwrap();
            session.register(&account).unwrap();
            assert!(account.is_attached());
        }
        assert!(!account.is_attached());
    }

    #[test]
    fn test_rolled_back_events_are_discarded() {
        let (_dir, store) = test_store();
        let mut session = store.open_session().unwrap();
        let account = new_account(1);

        session.begin().unwrap();
        session.register(&account).unwrap();
        session.flush().unwrap();
        let id = account.id().unwrap();
        session.rollback().unwrap();

        assert!(store.events_for_account(id).unwrap().is_empty());
    }
}
