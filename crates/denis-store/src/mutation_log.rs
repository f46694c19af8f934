use rusqlite::{params, Connection, ErrorCode};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::{ensure_parent_dir, StorageError, MUTATIONS_SCHEMA_VERSION};

/// Graph-materialization dedupe log: `mutation_id -> ts`.
///
/// The PRIMARY KEY insert is the atomic acquire. Any failure other than the
/// uniqueness constraint is treated as an acquire so a broken dedupe store
/// never blocks materialization (all graph writes stay MERGE-idempotent).
pub struct MutationLog {
    conn: Mutex<Connection>,
}

impl MutationLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        ensure_parent_dir(path.as_ref())?;
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(200))?;
        let log = Self {
            conn: Mutex::new(conn),
        };
        log.migrate()?;
        Ok(log)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let log = Self {
            conn: Mutex::new(conn),
        };
        log.migrate()?;
        Ok(log)
    }

    /// Default on-disk path, overridable via `DENIS_GML_DB_PATH`.
    pub fn default_path() -> String {
        std::env::var("DENIS_GML_DB_PATH").unwrap_or_else(|_| "./var/denis_gml.db".to_string())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn migrate(&self) -> Result<(), StorageError> {
        let conn = self.lock();
        let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if current > MUTATIONS_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: MUTATIONS_SCHEMA_VERSION,
            });
        }
        if current < 1 {
            conn.execute_batch(include_str!("../migrations/0001_mutations_schema.sql"))?;
            conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
        }
        Ok(())
    }

    /// True when this process is the first to record `mutation_id`.
    pub fn try_acquire(&self, mutation_id: &str) -> bool {
        let result = self.lock().execute(
            "INSERT INTO gml_mutations (mutation_id, ts) VALUES (?1, ?2)",
            params![mutation_id, denis_core::utc_now_iso()],
        );
        match result {
            Ok(_) => true,
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                false
            }
            Err(_) => true,
        }
    }

    pub fn mutation_count(&self) -> Result<i64, StorageError> {
        Ok(self
            .lock()
            .query_row("SELECT COUNT(*) FROM gml_mutations", [], |row| row.get(0))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_acquire_wins_replay_is_skipped() {
        let log = MutationLog::open_in_memory().expect("open log");
        assert!(log.try_acquire("m1"));
        assert!(!log.try_acquire("m1"));
        assert!(log.try_acquire("m2"));
        assert_eq!(log.mutation_count().expect("count"), 2);
    }
}
