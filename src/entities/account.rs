// 💳 Account Entity - surrogate id assigned by the store, business number from the caller
//
// "The account number is a VALUE the caller picks, the id is IDENTITY the store hands out"
//
// - `Account` is plain data: what a row holds, what a snapshot holds
// - `AccountRef` is an instance: a shared handle whose pointer identity is
//   what a session's identity map guarantees

use serde::{Deserialize, Serialize};
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;

// ============================================================================
// ACCOUNT VALUE
// ============================================================================

/// Account row data
///
/// Identity: `id` (None until the first flush, never changes afterwards)
/// Values: `account_nr`, `balance`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Surrogate key, assigned by the store on first flush
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,

    /// Business identifier supplied by the caller
    pub account_nr: i64,

    /// Signed balance in minor units
    #[serde(default)]
    pub balance: i64,
}

impl Account {
    /// New transient account with a zero balance
    pub fn new(account_nr: i64) -> Self {
        Account {
            id: None,
            account_nr,
            balance: 0,
        }
    }

    pub fn with_balance(mut self, balance: i64) -> Self {
        self.balance = balance;
        self
    }

    /// Copy the mutable state of `other` onto `self`, keeping `self.id`
    pub(crate) fn copy_state_from(&mut self, other: &Account) {
        self.account_nr = other.account_nr;
        self.balance = other.balance;
    }
}

// ============================================================================
// ACCOUNT INSTANCE HANDLE
// ============================================================================

struct AccountCell {
    value: RefCell<Account>,
    /// Session the instance is attached to (None = transient or detached)
    owner: Cell<Option<u64>>,
}

/// Shared handle to one in-memory account instance.
///
/// Cloning the handle does NOT copy the account: both clones are the same
/// instance, which is what `same` compares. Use `detached_copy` to get a
/// distinct instance carrying the same values.
#[derive(Clone)]
pub struct AccountRef {
    inner: Rc<AccountCell>,
}

impl AccountRef {
    pub fn new(account: Account) -> Self {
        AccountRef {
            inner: Rc::new(AccountCell {
                value: RefCell::new(account),
                owner: Cell::new(None),
            }),
        }
    }

    /// Is `other` the exact same instance?
    pub fn same(&self, other: &AccountRef) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// A new, unattached instance with the same values
    pub fn detached_copy(&self) -> AccountRef {
        AccountRef::new(self.snapshot())
    }

    pub fn borrow(&self) -> Ref<'_, Account> {
        self.inner.value.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, Account> {
        self.inner.value.borrow_mut()
    }

    /// Current values as a plain `Account`
    pub fn snapshot(&self) -> Account {
        self.inner.value.borrow().clone()
    }

    pub fn id(&self) -> Option<i64> {
        self.inner.value.borrow().id
    }

    /// Sets a local id. On an unpersisted account this is only a sentinel;
    /// see `PresetIdPolicy` for what flush does with it.
    pub fn set_id(&self, id: Option<i64>) {
        self.inner.value.borrow_mut().id = id;
    }

    pub fn account_nr(&self) -> i64 {
        self.inner.value.borrow().account_nr
    }

    pub fn balance(&self) -> i64 {
        self.inner.value.borrow().balance
    }

    pub fn set_balance(&self, balance: i64) {
        self.inner.value.borrow_mut().balance = balance;
    }

    /// Id of the session this instance is attached to
    pub fn session_id(&self) -> Option<u64> {
        self.inner.owner.get()
    }

    pub fn is_attached(&self) -> bool {
        self.inner.owner.get().is_some()
    }

    pub(crate) fn attach(&self, session_id: u64) {
        self.inner.owner.set(Some(session_id));
    }

    pub(crate) fn detach(&self) {
        self.inner.owner.set(None);
    }

    /// Overwrite all values, id included
    pub(crate) fn replace(&self, account: Account) {
        *self.inner.value.borrow_mut() = account;
    }
}

impl From<Account> for AccountRef {
    fn from(account: Account) -> Self {
        AccountRef::new(account)
    }
}

impl fmt::Debug for AccountRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountRef")
            .field("account", &*self.inner.value.borrow())
            .field("session", &self.inner.owner.get())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
