//! Chat history storage - conversation rows keyed by (user, timestamp).
//!
//! Keys are zero-padded `user:micros` strings so that a prefix range scan
//! returns one user's rows in timestamp order.

use anyhow::Result;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

const HISTORY_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("chat_history");

/// One stored conversation message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryRow {
    pub content: String,
    pub from_bot: bool,
}

/// Chat history storage
#[derive(Debug, Clone)]
pub struct HistoryStorage {
    db: Arc<Database>,
}

impl HistoryStorage {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(HISTORY_TABLE)?;
        write_txn.commit()?;

        Ok(Self { db })
    }

    fn row_key(user_id: u64, at: DateTime<Utc>) -> String {
        // Micros are monotonic enough per user; zero-padding keeps
        // lexicographic order equal to numeric order.
        format!("{:020}:{:020}", user_id, at.timestamp_micros().max(0))
    }

    fn user_prefix(user_id: u64) -> String {
        format!("{:020}:", user_id)
    }

    /// Append one message to a user's history.
    pub fn append(&self, user_id: u64, at: DateTime<Utc>, row: &HistoryRow) -> Result<()> {
        let key = Self::row_key(user_id, at);
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(HISTORY_TABLE)?;
            let serialized = serde_json::to_vec(row)?;
            table.insert(key.as_str(), serialized.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Return the most recent `limit` rows for a user, oldest first.
    pub fn recent(&self, user_id: u64, limit: usize) -> Result<Vec<HistoryRow>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(HISTORY_TABLE)?;

        let prefix = Self::user_prefix(user_id);
        let mut rows = Vec::new();
        let mut iter = table.range(prefix.as_str()..)?;
        while let Some(entry) = iter.next() {
            let (key, value) = entry?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            rows.push(serde_json::from_slice(value.value())?);
        }

        if rows.len() > limit {
            rows.drain(..rows.len() - limit);
        }
        Ok(rows)
    }

    /// Number of stored rows for a user.
    pub fn count(&self, user_id: u64) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(HISTORY_TABLE)?;

        let prefix = Self::user_prefix(user_id);
        let mut count = 0;
        let mut iter = table.range(prefix.as_str()..)?;
        while let Some(entry) = iter.next() {
            let (key, _) = entry?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    /// Delete a user's rows older than the cutoff. Returns rows removed.
    pub fn delete_before(&self, user_id: u64, cutoff: DateTime<Utc>) -> Result<usize> {
        let end_key = Self::row_key(user_id, cutoff);
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(HISTORY_TABLE)?;
            let prefix = Self::user_prefix(user_id);

            let mut keys = Vec::new();
            let mut iter = table.range(prefix.as_str()..end_key.as_str())?;
            while let Some(entry) = iter.next() {
                let (key, _) = entry?;
                keys.push(key.value().to_string());
            }
            drop(iter);

            for key in &keys {
                table.remove(key.as_str())?;
            }
            keys.len()
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// Delete all history rows for the given users in one transaction.
    ///
    /// The cleanup scheduler batches its per-run deletions through here so a
    /// run issues a single write against the store.
    pub fn delete_users(&self, user_ids: &[u64]) -> Result<usize> {
        let write_txn = self.db.begin_write()?;
        let mut removed = 0;
        {
            let mut table = write_txn.open_table(HISTORY_TABLE)?;
            for &user_id in user_ids {
                let prefix = Self::user_prefix(user_id);

                let mut keys = Vec::new();
                let mut iter = table.range(prefix.as_str()..)?;
                while let Some(entry) = iter.next() {
                    let (key, _) = entry?;
                    if !key.value().starts_with(&prefix) {
                        break;
                    }
                    keys.push(key.value().to_string());
                }
                drop(iter);

                for key in &keys {
                    table.remove(key.as_str())?;
                }
                removed += keys.len();
            }
        }
        write_txn.commit()?;
        debug!(users = user_ids.len(), removed, "deleted history rows");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    fn open() -> (tempfile::TempDir, HistoryStorage) {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Arc::new(Database::create(db_path).unwrap());
        let storage = HistoryStorage::new(db).unwrap();
        (temp_dir, storage)
    }

    fn row(content: &str) -> HistoryRow {
        HistoryRow {
            content: content.to_string(),
            from_bot: false,
        }
    }

    #[test]
    fn test_append_and_recent_order() {
        let (_dir, storage) = open();
        let base = Utc::now();

        storage.append(1, base, &row("first")).unwrap();
        storage.append(1, base + Duration::seconds(1), &row("second")).unwrap();
        storage.append(1, base + Duration::seconds(2), &row("third")).unwrap();
        storage.append(2, base, &row("other user")).unwrap();

        let rows = storage.recent(1, 10).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].content, "first");
        assert_eq!(rows[2].content, "third");

        let last_two = storage.recent(1, 2).unwrap();
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[0].content, "second");
        assert_eq!(last_two[1].content, "third");
    }

    #[test]
    fn test_delete_before() {
        let (_dir, storage) = open();
        let base = Utc::now();

        storage.append(1, base - Duration::hours(2), &row("old")).unwrap();
        storage.append(1, base, &row("new")).unwrap();

        let removed = storage.delete_before(1, base - Duration::hours(1)).unwrap();
        assert_eq!(removed, 1);

        let rows = storage.recent(1, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content, "new");
    }

    #[test]
    fn test_delete_users_is_batched_per_user() {
        let (_dir, storage) = open();
        let base = Utc::now();

        storage.append(1, base, &row("a")).unwrap();
        storage.append(1, base + Duration::seconds(1), &row("b")).unwrap();
        storage.append(2, base, &row("c")).unwrap();
        storage.append(3, base, &row("kept")).unwrap();

        let removed = storage.delete_users(&[1, 2]).unwrap();
        assert_eq!(removed, 3);
        assert_eq!(storage.count(1).unwrap(), 0);
        assert_eq!(storage.count(2).unwrap(), 0);
        assert_eq!(storage.count(3).unwrap(), 1);
    }
}
