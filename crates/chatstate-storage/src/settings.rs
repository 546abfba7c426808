//! User settings storage - provider/model selection keyed by user id.

use anyhow::Result;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const SETTINGS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("user_settings");

/// Per-user settings row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserSettings {
    pub provider: String,
    pub model: String,
    pub updated_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl UserSettings {
    pub fn new(provider: &str, model: &str) -> Self {
        let now = Utc::now();
        Self {
            provider: provider.to_string(),
            model: model.to_string(),
            updated_at: now,
            last_activity: now,
        }
    }
}

/// User settings storage
#[derive(Debug, Clone)]
pub struct SettingsStorage {
    db: Arc<Database>,
}

impl SettingsStorage {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(SETTINGS_TABLE)?;
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Get settings for a user.
    pub fn get(&self, user_id: u64) -> Result<Option<UserSettings>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SETTINGS_TABLE)?;

        if let Some(data) = table.get(user_id)? {
            let settings = serde_json::from_slice(data.value())?;
            Ok(Some(settings))
        } else {
            Ok(None)
        }
    }

    /// Upsert settings for a user, refreshing `updated_at` and `last_activity`.
    pub fn put(&self, user_id: u64, settings: &UserSettings) -> Result<()> {
        let mut row = settings.clone();
        let now = Utc::now();
        row.updated_at = now;
        row.last_activity = now;

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SETTINGS_TABLE)?;
            let serialized = serde_json::to_vec(&row)?;
            table.insert(user_id, serialized.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Refresh a user's activity timestamp. Returns false if the user has no
    /// settings row yet.
    pub fn touch(&self, user_id: u64) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let touched = {
            let mut table = write_txn.open_table(SETTINGS_TABLE)?;
            let row = match table.get(user_id)? {
                Some(data) => {
                    let mut row: UserSettings = serde_json::from_slice(data.value())?;
                    row.last_activity = Utc::now();
                    Some(row)
                }
                None => None,
            };
            match row {
                Some(row) => {
                    let serialized = serde_json::to_vec(&row)?;
                    table.insert(user_id, serialized.as_slice())?;
                    true
                }
                None => false,
            }
        };
        write_txn.commit()?;
        Ok(touched)
    }

    /// Delete a user's settings row.
    pub fn delete(&self, user_id: u64) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(SETTINGS_TABLE)?;
            table.remove(user_id)?.is_some()
        };
        write_txn.commit()?;
        Ok(existed)
    }

    /// List users whose last activity is older than the cutoff.
    ///
    /// Drives the cleanup scheduler; the predicate is idempotent so a run
    /// that fails midway is simply retried on the next tick.
    pub fn inactive_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<u64>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SETTINGS_TABLE)?;

        let mut users = Vec::new();
        for item in table.iter()? {
            let (key, value) = item?;
            let row: UserSettings = serde_json::from_slice(value.value())?;
            if row.last_activity < cutoff {
                users.push(key.value());
            }
        }

        Ok(users)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    fn open() -> (tempfile::TempDir, SettingsStorage) {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Arc::new(Database::create(db_path).unwrap());
        let storage = SettingsStorage::new(db).unwrap();
        (temp_dir, storage)
    }

    #[test]
    fn test_put_and_get() {
        let (_dir, storage) = open();

        assert!(storage.get(1).unwrap().is_none());

        storage.put(1, &UserSettings::new("openai", "gpt-4")).unwrap();
        let row = storage.get(1).unwrap().unwrap();
        assert_eq!(row.provider, "openai");
        assert_eq!(row.model, "gpt-4");
    }

    #[test]
    fn test_touch_requires_existing_row() {
        let (_dir, storage) = open();

        assert!(!storage.touch(7).unwrap());

        storage
            .put(7, &UserSettings::new("anthropic", "claude"))
            .unwrap();
        let before = storage.get(7).unwrap().unwrap().last_activity;
        assert!(storage.touch(7).unwrap());
        let after = storage.get(7).unwrap().unwrap().last_activity;
        assert!(after >= before);
    }

    #[test]
    fn test_inactive_since() {
        let (_dir, storage) = open();

        storage.put(1, &UserSettings::new("openai", "gpt-4")).unwrap();
        storage.put(2, &UserSettings::new("openai", "gpt-4")).unwrap();

        // Nothing is older than a cutoff in the past.
        let past = Utc::now() - Duration::hours(1);
        assert!(storage.inactive_since(past).unwrap().is_empty());

        // Everything is older than a cutoff in the future.
        let future = Utc::now() + Duration::hours(1);
        let mut users = storage.inactive_since(future).unwrap();
        users.sort_unstable();
        assert_eq!(users, vec![1, 2]);
    }

    #[test]
    fn test_delete() {
        let (_dir, storage) = open();

        storage.put(3, &UserSettings::new("openai", "gpt-4")).unwrap();
        assert!(storage.delete(3).unwrap());
        assert!(!storage.delete(3).unwrap());
        assert!(storage.get(3).unwrap().is_none());
    }
}
