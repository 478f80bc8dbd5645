// ⚙️ Store configuration
// Loaded from a JSON file, with an environment override for the database path

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{PersistenceError, Result};

/// Environment variable overriding `database_path`
pub const DATABASE_PATH_ENV: &str = "BANK_DATABASE_PATH";

// ============================================================================
// POLICIES
// ============================================================================

/// What flush does with an id set by application code on a new account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PresetIdPolicy {
    /// The sentinel is replaced by the id the store generates
    #[default]
    Overwrite,
    /// Flush fails with a constraint violation
    Reject,
}

/// When pending changes reach the store ahead of commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// Queries flush pending changes first when a transaction is open
    #[default]
    Auto,
    /// Only explicit flush() and commit() touch the store
    Commit,
}

// ============================================================================
// STORE CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file
    pub database_path: PathBuf,

    /// How long a connection waits on a locked database before giving up
    pub busy_timeout_ms: u64,

    /// Use the WAL journal (readers don't block the writer)
    pub wal: bool,

    pub preset_id_policy: PresetIdPolicy,

    pub flush_mode: FlushMode,

    /// Write an audit event for every insert/update/delete
    pub audit_events: bool,

    /// Enforce uniqueness of account numbers with an index
    pub unique_account_nr: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            database_path: PathBuf::from("bank.db"),
            busy_timeout_ms: 5_000,
            wal: true,
            preset_id_policy: PresetIdPolicy::default(),
            flush_mode: FlushMode::default(),
            audit_events: true,
            unique_account_nr: false,
        }
    }
}

impl StoreConfig {
    /// Default config pointing at the given database file
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        StoreConfig {
            database_path: path.into(),
            ..StoreConfig::default()
        }
    }

    /// Load config from a JSON file; missing keys fall back to defaults
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            PersistenceError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: StoreConfig = serde_json::from_str(&content)?;
        config.validate()?;

        tracing::debug!("Loaded store config from {}", path.display());
        Ok(config)
    }

    /// Apply environment overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(path) = std::env::var(DATABASE_PATH_ENV) {
            if !path.trim().is_empty() {
                self.database_path = PathBuf::from(path);
            }
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(PersistenceError::Config(
                "database_path must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}
