use denis_core::EventV1;
use rusqlite::{params, Connection, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::{ensure_parent_dir, StorageError, EVENTS_SCHEMA_VERSION};

pub const DEFAULT_RETENTION: i64 = 2000;

const BUSY_TIMEOUT: Duration = Duration::from_millis(200);

/// Append-only event log keyed by `(conversation_id, event_id)`.
///
/// `event_id` is assigned inside a single `BEGIN IMMEDIATE` transaction so
/// concurrent appends to the same conversation can never produce gaps or
/// duplicates.
pub struct EventStore {
    conn: Mutex<Connection>,
}

impl EventStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        ensure_parent_dir(path.as_ref())?;
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Default on-disk path, overridable via `DENIS_EVENTS_DB_PATH`.
    pub fn default_path() -> String {
        std::env::var("DENIS_EVENTS_DB_PATH")
            .unwrap_or_else(|_| "./var/denis_events.db".to_string())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .lock()
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    fn migrate(&self) -> Result<(), StorageError> {
        let conn = self.lock();
        let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if current > EVENTS_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: EVENTS_SCHEMA_VERSION,
            });
        }
        if current < 1 {
            conn.execute_batch(include_str!("../migrations/0001_events_schema.sql"))?;
            conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
        }
        Ok(())
    }

    /// Persist `event` and return it with the assigned `event_id`.
    ///
    /// Retention prunes the contiguous prefix `event_id <= new_id - retention`
    /// for this conversation inside the same transaction.
    pub fn append(
        &self,
        conversation_id: &str,
        event: &EventV1,
        retention: i64,
    ) -> Result<EventV1, StorageError> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let max_id: i64 = tx.query_row(
            "SELECT COALESCE(MAX(event_id), 0) FROM denis_events WHERE conversation_id = ?1",
            [conversation_id],
            |row| row.get(0),
        )?;
        let event_id = max_id + 1;

        let mut stored = event.clone();
        stored.event_id = event_id;
        stored.conversation_id = conversation_id.to_string();

        let event_json = serde_json::to_string(&stored)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;

        tx.execute(
            "
            INSERT INTO denis_events (conversation_id, event_id, ts, trace_id, type, severity, event_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
            params![
                conversation_id,
                event_id,
                stored.ts,
                stored.trace_id,
                stored.r#type,
                stored.severity.as_str(),
                event_json,
            ],
        )?;

        if retention > 0 {
            let threshold = event_id - retention;
            if threshold > 0 {
                tx.execute(
                    "DELETE FROM denis_events WHERE conversation_id = ?1 AND event_id <= ?2",
                    params![conversation_id, threshold],
                )?;
            }
        }

        tx.commit()?;
        Ok(stored)
    }

    /// All events with `event_id > after_event_id`, ascending. Rows whose
    /// JSON no longer parses are skipped.
    pub fn query_after(
        &self,
        conversation_id: &str,
        after_event_id: i64,
    ) -> Result<Vec<EventV1>, StorageError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "
            SELECT event_json
            FROM denis_events
            WHERE conversation_id = ?1 AND event_id > ?2
            ORDER BY event_id ASC
            ",
        )?;
        let rows = stmt.query_map(params![conversation_id, after_event_id], |row| {
            row.get::<_, String>(0)
        })?;

        let mut out = Vec::new();
        for raw in rows {
            let raw = raw?;
            if let Ok(event) = serde_json::from_str::<EventV1>(&raw) {
                out.push(event);
            }
        }
        Ok(out)
    }

    pub fn event_count(&self, conversation_id: &str) -> Result<i64, StorageError> {
        Ok(self.lock().query_row(
            "SELECT COUNT(*) FROM denis_events WHERE conversation_id = ?1",
            [conversation_id],
            |row| row.get(0),
        )?)
    }
}
