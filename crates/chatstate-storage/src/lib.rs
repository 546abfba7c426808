//! ChatState Storage - Durable store adapter for conversational state
//!
//! This crate provides the persistence layer for ChatState, using redb as the
//! embedded write-ahead-logged database. Writes serialize on a single logical
//! writer inside redb; reads run concurrently.
//!
//! # Tables
//!
//! - `user_settings` - Per-user provider/model selection and activity tracking
//! - `chat_history` - Conversation history rows keyed by (user, timestamp)
//! - `usage_stats` - Per-user daily message/token accounting
//!
//! The storage layer is the single source of truth. The cache layer in
//! chatstate-core is a disposable derived view over these tables.

pub mod history;
pub mod settings;
pub mod usage;

use anyhow::Result;
use redb::{Database, ReadableDatabase};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub use history::{HistoryRow, HistoryStorage};
pub use settings::{SettingsStorage, UserSettings};
pub use usage::{UsageRecord, UsageStorage};

/// Central storage manager that initializes all storage subsystems
pub struct Storage {
    db: Arc<Database>,
    pub settings: SettingsStorage,
    pub history: HistoryStorage,
    pub usage: UsageStorage,
}

impl Storage {
    /// Create a new storage instance at the given path.
    ///
    /// This will create the database file if it doesn't exist and initialize
    /// all required tables.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening storage database");
        let db = Arc::new(Database::create(path)?);
        Self::with_database(db)
    }

    /// Build the storage manager over an already opened database.
    pub fn with_database(db: Arc<Database>) -> Result<Self> {
        let settings = SettingsStorage::new(db.clone())?;
        let history = HistoryStorage::new(db.clone())?;
        let usage = UsageStorage::new(db.clone())?;

        Ok(Self {
            db,
            settings,
            history,
            usage,
        })
    }

    /// Cheap liveness probe used by the connection pool health check.
    ///
    /// Beginning a read transaction exercises the database handle without
    /// touching any table.
    pub fn ping(&self) -> Result<()> {
        self.db.begin_read()?;
        Ok(())
    }

    /// Get a reference to the underlying database
    pub fn get_db(&self) -> Arc<Database> {
        self.db.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_and_ping() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let storage = Storage::new(&db_path).unwrap();
        storage.ping().unwrap();
    }

    #[test]
    fn test_reopen_preserves_data() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("test.db");

        {
            let storage = Storage::new(&db_path).unwrap();
            storage
                .settings
                .put(42, &UserSettings::new("openai", "gpt-4"))
                .unwrap();
        }

        let storage = Storage::new(&db_path).unwrap();
        let settings = storage.settings.get(42).unwrap().unwrap();
        assert_eq!(settings.provider, "openai");
    }
}
