use std::path::Path;

use redb::{ReadableDatabase, ReadableTable, TableDefinition};

use crate::{
    error::Result,
    resolver::{CacheEntry, CacheStore, best_response},
    store::SharedDatabase,
};

/// (kind, dataset, config, split) -> JSON-encoded [`CacheEntry`].
const RESPONSES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("cached_responses");

/// Local response cache, for running without the external cache service.
/// Like the job queue, the file is only held for one operation at a time.
pub struct CacheDb {
    db: SharedDatabase,
}

impl CacheDb {
    /// Open or create the cache database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let db = SharedDatabase::new(path);
        db.with_db(|db| {
            let txn = db.begin_write()?;
            txn.open_table(RESPONSES)?;
            txn.commit()?;
            Ok(())
        })?;
        Ok(Self { db })
    }

    /// Insert or replace the entry of one kind for a split.
    pub fn upsert(
        &self,
        kind: &str,
        dataset: &str,
        config: &str,
        split: &str,
        entry: &CacheEntry,
    ) -> Result<()> {
        let key = entry_key(kind, dataset, config, split);
        let bytes = serde_json::to_vec(entry)?;

        self.db.with_db(|db| {
            let txn = db.begin_write()?;
            txn.open_table(RESPONSES)?
                .insert(key.as_str(), bytes.as_slice())?;
            txn.commit()?;
            Ok(())
        })
    }

    pub fn get(
        &self,
        kind: &str,
        dataset: &str,
        config: &str,
        split: &str,
    ) -> Result<Option<CacheEntry>> {
        let key = entry_key(kind, dataset, config, split);
        self.db.with_db(|db| {
            let txn = db.begin_read()?;
            let table = txn.open_table(RESPONSES)?;
            match table.get(key.as_str())? {
                Some(bytes) => Ok(Some(serde_json::from_slice(bytes.value())?)),
                None => Ok(None),
            }
        })
    }

    /// Drop the entry of one kind for a split. Returns whether it existed.
    pub fn remove(
        &self,
        kind: &str,
        dataset: &str,
        config: &str,
        split: &str,
    ) -> Result<bool> {
        let key = entry_key(kind, dataset, config, split);
        self.db.with_db(|db| {
            let txn = db.begin_write()?;
            let existed =
                txn.open_table(RESPONSES)?.remove(key.as_str())?.is_some();
            txn.commit()?;
            Ok(existed)
        })
    }
}

impl CacheStore for CacheDb {
    fn get_best_response(
        &self,
        kinds: &[&str],
        dataset: &str,
        config: &str,
        split: &str,
    ) -> Result<CacheEntry> {
        best_response(kinds, |kind| self.get(kind, dataset, config, split))
    }
}

impl std::fmt::Debug for CacheDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheDb").finish_non_exhaustive()
    }
}

/// NUL never appears in dataset, config or split names.
fn entry_key(kind: &str, dataset: &str, config: &str, split: &str) -> String {
    format!("{kind}\0{dataset}\0{config}\0{split}")
}
