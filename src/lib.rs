// Bank Persistence - Core Library
// Session (identity map + change log) over a transactional SQLite account store

pub mod config;
pub mod dao;
pub mod db;
pub mod entities;
pub mod error;
pub mod import;
pub mod logging;
pub mod service;
pub mod session;

// Re-export commonly used types
pub use config::{FlushMode, PresetIdPolicy, StoreConfig};
pub use dao::{AccountDao, SessionAccountDao};
pub use db::{AccountEvent, EventKind, Store};
pub use entities::{Account, AccountRef};
pub use error::{PersistenceError, Result};
pub use import::{load_csv, AccountRecord};
pub use service::AccountMgr;
pub use session::Session;
