// 📒 Account DAO - data access on top of a session
//
// The service talks to accounts through this trait; the session-backed
// implementation is the only one, but tests and callers depend on the trait.

use crate::entities::AccountRef;
use crate::error::{PersistenceError, Result};
use crate::session::Session;

pub trait AccountDao {
    /// Number of stored accounts
    fn count(&mut self) -> Result<i64>;

    /// Schedule a new account for insertion
    fn create(&mut self, account: &AccountRef) -> Result<()>;

    /// Merge changes of a (possibly detached) account; returns the managed instance
    fn edit(&mut self, account: &AccountRef) -> Result<AccountRef>;

    fn find(&mut self, id: i64) -> Result<Option<AccountRef>>;

    fn find_all(&mut self) -> Result<Vec<AccountRef>>;

    /// The account with this number; `NonUniqueResult` if there are several
    fn find_by_account_nr(&mut self, account_nr: i64) -> Result<Option<AccountRef>>;

    fn remove(&mut self, account: &AccountRef) -> Result<()>;
}

/// `AccountDao` that delegates to a borrowed session
pub struct SessionAccountDao<'s> {
    session: &'s mut Session,
}

impl<'s> SessionAccountDao<'s> {
    pub fn new(session: &'s mut Session) -> Self {
        SessionAccountDao { session }
    }
}

impl AccountDao for SessionAccountDao<'_> {
    fn count(&mut self) -> Result<i64> {
        self.session.count()
    }

    fn create(&mut self, account: &AccountRef) -> Result<()> {
        self.session.register(account)
    }

    fn edit(&mut self, account: &AccountRef) -> Result<AccountRef> {
        self.session.merge(account)
    }

    fn find(&mut self, id: i64) -> Result<Option<AccountRef>> {
        self.session.find(id)
    }

    fn find_all(&mut self) -> Result<Vec<AccountRef>> {
        self.session.find_all()
    }

    fn find_by_account_nr(&mut self, account_nr: i64) -> Result<Option<AccountRef>> {
        let mut matches = self.session.find_by_account_nr(account_nr)?;
        match matches.len() {
            0 => Ok(None),
            1 => Ok(matches.pop()),
            n => Err(PersistenceError::NonUniqueResult(format!(
                "{} accounts with account number {}",
                n, account_nr
            ))),
        }
    }

    fn remove(&mut self, account: &AccountRef) -> Result<()> {
        self.session.remove(account)
    }
}
