// 🏦 Account service - one session and one transaction per call
//
// Failures roll the transaction back and are returned to the caller.

use crate::dao::{AccountDao, SessionAccountDao};
use crate::db::Store;
use crate::entities::{Account, AccountRef};
use crate::error::Result;
use crate::import::AccountRecord;
use crate::session::Session;

pub struct AccountMgr {
    store: Store,
}

impl AccountMgr {
    pub fn new(store: Store) -> Self {
        AccountMgr { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Create and commit a new account with a zero balance
    pub fn create_account(&self, account_nr: i64) -> Result<Account> {
        let account = AccountRef::new(Account::new(account_nr));

        self.in_transaction("create_account", |dao| dao.create(&account))?;

        tracing::info!(account_nr, id = ?account.id(), "account created");
        Ok(account.snapshot())
    }

    /// Look an account up by its number
    pub fn get_account(&self, account_nr: i64) -> Result<Option<Account>> {
        let found = self.in_transaction("get_account", |dao| dao.find_by_account_nr(account_nr))?;
        Ok(found.map(|account| account.snapshot()))
    }

    pub fn list_accounts(&self) -> Result<Vec<Account>> {
        let all = self.in_transaction("list_accounts", |dao| dao.find_all())?;
        Ok(all.iter().map(AccountRef::snapshot).collect())
    }

    /// Insert all records in one transaction: either every account is
    /// created or none is
    pub fn import_accounts(&self, records: Vec<AccountRecord>) -> Result<Vec<Account>> {
        let accounts: Vec<AccountRef> = records
            .into_iter()
            .map(|record| AccountRef::new(record.into()))
            .collect();

        self.in_transaction("import_accounts", |dao| {
            for account in &accounts {
                dao.create(account)?;
            }
            Ok(())
        })?;

        tracing::info!(imported = accounts.len(), "accounts imported");
        Ok(accounts.iter().map(AccountRef::snapshot).collect())
    }

    /// Run `work` inside begin/commit on a fresh session; roll back and
    /// return the error if anything fails
    fn in_transaction<T, F>(&self, operation: &str, work: F) -> Result<T>
    where
        F: FnOnce(&mut dyn AccountDao) -> Result<T>,
    {
        let mut session = self.store.open_session()?;
        session.begin()?;

        let outcome = {
            let mut dao = SessionAccountDao::new(&mut session);
            work(&mut dao)
        }
        .and_then(|value| session.commit().map(|_| value));

        match outcome {
            Ok(value) => {
                session.close()?;
                Ok(value)
            }
            Err(e) => {
                tracing::error!(
                    operation,
                    kind = e.kind(),
                    error = %e,
                    "transaction failed, rolling back"
                );
                rollback_quietly(&mut session);
                Err(e)
            }
        }
    }
}

fn rollback_quietly(session: &mut Session) {
    if session.is_active() {
        if let Err(e) = session.rollback() {
            tracing::warn!(error = %e, "rollback failed");
        }
    }
}
