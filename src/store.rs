//! redb files shared between processes.
//!
//! redb locks a database file for as long as a [`Database`] is open, so a
//! long-lived handle would shut every other producer, worker and search
//! process out. [`SharedDatabase`] opens the file for one operation at a
//! time and closes it right after; a caller that finds the file locked backs
//! off and retries until its open timeout runs out.

use std::{
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use rand::Rng;
use redb::{Database, DatabaseError};

use crate::error::Result;

/// How long an operation waits for another process to release the file.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(30);

const FIRST_BACKOFF: Duration = Duration::from_millis(2);
const MAX_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct SharedDatabase {
    path: PathBuf,
    open_timeout: Duration,
}

impl SharedDatabase {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            open_timeout: DEFAULT_OPEN_TIMEOUT,
        }
    }

    pub fn with_open_timeout(mut self, open_timeout: Duration) -> Self {
        self.open_timeout = open_timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `op` against the database, holding the file only for its
    /// duration.
    pub fn with_db<T>(
        &self,
        op: impl FnOnce(&Database) -> Result<T>,
    ) -> Result<T> {
        let db = self.open()?;
        op(&db)
    }

    fn open(&self) -> Result<Database> {
        let deadline = Instant::now() + self.open_timeout;
        let mut backoff = FIRST_BACKOFF;
        let mut attempts = 0u32;

        loop {
            match Database::create(&self.path) {
                Ok(db) => return Ok(db),
                Err(DatabaseError::DatabaseAlreadyOpen)
                    if Instant::now() < deadline =>
                {
                    attempts += 1;
                    if attempts == 1 {
                        tracing::debug!(
                            path = %self.path.display(),
                            "database busy, waiting"
                        );
                    }
                    let pause =
                        backoff.mul_f64(rand::rng().random_range(0.5..1.0));
                    thread::sleep(pause);
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(err) => {
                    if attempts > 0 {
                        tracing::warn!(
                            path = %self.path.display(),
                            attempts,
                            "gave up waiting for database"
                        );
                    }
                    return Err(err.into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use redb::{ReadableTable, TableDefinition};

    use super::*;
    use crate::error::Error;

    const NUMBERS: TableDefinition<&str, u64> = TableDefinition::new("n");

    fn write(shared: &SharedDatabase, value: u64) -> Result<()> {
        shared.with_db(|db| {
            let txn = db.begin_write()?;
            txn.open_table(NUMBERS)?.insert("k", value)?;
            txn.commit()?;
            Ok(())
        })
    }

    #[test]
    fn file_is_released_between_operations() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("shared.redb");
        let a = SharedDatabase::new(&path);
        let b = SharedDatabase::new(&path);

        write(&a, 1).unwrap();
        write(&b, 2).unwrap();

        // Nothing holds the file now: a plain open succeeds.
        let db = Database::create(&path).unwrap();
        let txn = db.begin_write().unwrap();
        let table = txn.open_table(NUMBERS).unwrap();
        let value = table.get("k").unwrap().map(|v| v.value());
        assert_eq!(value, Some(2));
    }

    #[test]
    fn waits_for_a_holder_to_release_the_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("shared.redb");
        let held = Database::create(&path).unwrap();

        let shared = SharedDatabase::new(&path);
        let writer = thread::spawn(move || write(&shared, 7));
        thread::sleep(Duration::from_millis(150));
        drop(held);

        writer.join().unwrap().unwrap();
    }

    #[test]
    fn gives_up_after_the_open_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("shared.redb");
        let _held = Database::create(&path).unwrap();

        let shared = SharedDatabase::new(&path)
            .with_open_timeout(Duration::from_millis(50));
        let err = write(&shared, 1).unwrap_err();

        assert!(matches!(
            err,
            Error::RedbDatabase(DatabaseError::DatabaseAlreadyOpen)
        ));
    }
}
