//! Usage statistics storage - per-user daily message/token accounting.

use anyhow::Result;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

const USAGE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("usage_stats");

/// Accumulated usage for one user on one day.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UsageRecord {
    pub messages: u64,
    pub tokens: u64,
}

/// Usage statistics storage
#[derive(Debug, Clone)]
pub struct UsageStorage {
    db: Arc<Database>,
}

impl UsageStorage {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(USAGE_TABLE)?;
        write_txn.commit()?;

        Ok(Self { db })
    }

    fn day_key(user_id: u64, day: &str) -> String {
        format!("{day}:{user_id:020}")
    }

    /// Add message/token counts for a user on the given day (YYYY-MM-DD).
    pub fn record(&self, user_id: u64, day: &str, messages: u64, tokens: u64) -> Result<()> {
        let key = Self::day_key(user_id, day);
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(USAGE_TABLE)?;
            let mut record = match table.get(key.as_str())? {
                Some(data) => serde_json::from_slice::<UsageRecord>(data.value())?,
                None => UsageRecord::default(),
            };
            record.messages = record.messages.saturating_add(messages);
            record.tokens = record.tokens.saturating_add(tokens);

            let serialized = serde_json::to_vec(&record)?;
            table.insert(key.as_str(), serialized.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Per-user totals for all days at or after `since_day` (YYYY-MM-DD).
    pub fn totals_since(&self, since_day: &str) -> Result<BTreeMap<u64, UsageRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(USAGE_TABLE)?;

        let mut totals: BTreeMap<u64, UsageRecord> = BTreeMap::new();
        let mut iter = table.range(since_day..)?;
        while let Some(entry) = iter.next() {
            let (key, value) = entry?;
            let key_str = key.value();
            let Some((_, user)) = key_str.rsplit_once(':') else {
                continue;
            };
            let Ok(user_id) = user.parse::<u64>() else {
                continue;
            };
            let record: UsageRecord = serde_json::from_slice(value.value())?;
            let total = totals.entry(user_id).or_default();
            total.messages += record.messages;
            total.tokens += record.tokens;
        }

        Ok(totals)
    }
}
