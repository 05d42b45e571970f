use crate::core::error::MailError;
use crate::core::schemas;
use rusqlite::{Connection, params};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub fn db_connect(db_path: &Path, busy_timeout_ms: u64) -> Result<Connection, MailError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(Duration::from_millis(busy_timeout_ms))?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
    conn.execute_batch("PRAGMA foreign_keys=ON; PRAGMA synchronous=NORMAL;")?;
    Ok(conn)
}

pub fn index_db_path(root: &Path) -> PathBuf {
    root.join(schemas::INDEX_DB_NAME)
}

/// Create tables, indexes and FTS triggers. Idempotent.
pub fn initialize_index_db(conn: &Connection) -> Result<(), MailError> {
    conn.execute_batch(schemas::INDEX_DB_SCHEMA)?;
    conn.execute(
        "INSERT INTO meta(key, value) VALUES('schema_version', ?1)
         ON CONFLICT(key) DO NOTHING",
        params![schemas::SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}
