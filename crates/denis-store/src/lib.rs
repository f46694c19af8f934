use thiserror::Error;

mod event_store;
mod mutation_log;

pub use event_store::{EventStore, DEFAULT_RETENTION};
pub use mutation_log::MutationLog;

pub const EVENTS_SCHEMA_VERSION: i64 = 1;
pub const MUTATIONS_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub(crate) fn ensure_parent_dir(path: &std::path::Path) -> Result<(), StorageError> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    Ok(())
}
