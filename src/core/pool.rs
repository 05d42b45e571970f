//! SQLite access with read/write separation and busy retry.
//!
//! - Writes are serialized through a per-pool mutex and run inside a single
//!   `BEGIN IMMEDIATE` transaction per logical operation.
//! - Reads open a fresh connection with no mutex; WAL gives each read a
//!   consistent snapshot and readers never wait on writers.
//! - `SQLITE_BUSY`/`SQLITE_LOCKED` from another process is retried with
//!   exponential backoff before being surfaced.
//!
//! Connections are opened per operation rather than cached so that no handle
//! outlives the operation that needed it.

use crate::core::db;
use crate::core::error::MailError;
use parking_lot::Mutex;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// Base delay for exponential backoff (milliseconds).
const BASE_DELAY_MS: u64 = 100;
/// Maximum delay cap (milliseconds).
const MAX_DELAY_MS: u64 = 5_000;

pub struct SqlitePool {
    db_path: PathBuf,
    write_lock: Mutex<()>,
    busy_timeout_ms: u64,
    max_retries: u32,
}

impl SqlitePool {
    pub fn new(db_path: &Path, busy_timeout_ms: u64, max_retries: u32) -> Self {
        Self {
            db_path: db_path.to_path_buf(),
            write_lock: Mutex::new(()),
            busy_timeout_ms,
            max_retries,
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Run `f` inside one immediate transaction. The transaction commits only if
    /// `f` returns `Ok`; any error rolls it back. Busy failures retry the whole
    /// closure, so it must not have side effects outside the transaction.
    pub fn with_transaction<F, R>(&self, mut f: F) -> Result<R, MailError>
    where
        F: FnMut(&Transaction<'_>) -> Result<R, MailError>,
    {
        let _guard = self.write_lock.lock();
        retry_on_busy(self.max_retries, || {
            let mut conn = db::db_connect(&self.db_path, self.busy_timeout_ms)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
    }

    /// Execute a closure with a read connection (no mutex serialization).
    pub fn with_read<F, R>(&self, f: F) -> Result<R, MailError>
    where
        F: FnOnce(&Connection) -> Result<R, MailError>,
    {
        let conn = db::db_connect(&self.db_path, self.busy_timeout_ms)?;
        f(&conn)
    }
}

/// Retry a closure on `SQLITE_BUSY` / `SQLITE_LOCKED` with exponential backoff.
pub fn retry_on_busy<F, R>(max_retries: u32, mut f: F) -> Result<R, MailError>
where
    F: FnMut() -> Result<R, MailError>,
{
    let mut attempt = 0u32;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if e.is_busy() && attempt < max_retries => {
                attempt += 1;
                let delay_ms = (BASE_DELAY_MS * 2u64.pow(attempt - 1)).min(MAX_DELAY_MS);
                tracing::debug!(attempt, delay_ms, "index database busy, retrying");
                thread::sleep(Duration::from_millis(delay_ms));
            }
            Err(e) => return Err(e),
        }
    }
}
