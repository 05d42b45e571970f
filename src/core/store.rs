//! Store handle.
//!
//! A `Store` is the context passed to every operation: the root directory, the
//! loaded configuration, the index pool and the in-process half of the archive
//! locks. It is `Send + Sync`; share it between threads through `Arc<Store>`.
//!
//! Layout under the root:
//!
//! ```text
//! <root>/mailroom.toml   optional configuration
//! <root>/index.db        SQLite index (WAL)
//! <root>/archive/        git working copy mirrored from the index
//! ```

use crate::core::config::Config;
use crate::core::db;
use crate::core::error::MailError;
use crate::core::lock::{CommitLock, LockSettings, LockTable, ProjectLock};
use crate::core::pool::SqlitePool;
use crate::plugins::archive;
use std::fs;
use std::path::{Path, PathBuf};

pub const ARCHIVE_DIR_NAME: &str = "archive";

pub struct Store {
    /// Absolute path to the store root directory
    pub root: PathBuf,
    pub config: Config,
    pool: SqlitePool,
    locks: LockTable,
}

impl Store {
    /// Open (creating if needed) the store at `root`, reading `mailroom.toml`
    /// and `MAILROOM_*` overrides.
    pub fn open(root: &Path) -> Result<Store, MailError> {
        fs::create_dir_all(root)?;
        let config = Config::load(root)?;
        Self::open_with_config(root, config)
    }

    pub fn open_with_config(root: &Path, config: Config) -> Result<Store, MailError> {
        config.validate()?;
        fs::create_dir_all(root)?;
        let root = root.canonicalize()?;
        let db_path = db::index_db_path(&root);
        let pool = SqlitePool::new(
            &db_path,
            config.index.busy_timeout_ms,
            config.index.max_busy_retries,
        );
        pool.with_transaction(|tx| db::initialize_index_db(tx))?;

        let store = Store {
            root,
            config,
            pool,
            locks: LockTable::new(),
        };

        // The archive is a mirror: a broken or missing git must not stop the
        // index from serving. Mirrors retry initialisation and report degraded.
        if let Err(err) = archive::ensure_archive(&store) {
            tracing::warn!(error = %err, "archive initialisation failed; mirrors will be degraded");
        }
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn archive_root(&self) -> PathBuf {
        self.root.join(ARCHIVE_DIR_NAME)
    }

    pub fn project_archive_dir(&self, slug: &str) -> PathBuf {
        self.archive_root().join("projects").join(slug)
    }

    pub fn lock_settings(&self) -> LockSettings {
        LockSettings::new(
            self.config.archive.lock_timeout_ms,
            self.config.archive.stale_lock_secs,
        )
    }

    /// Take the project lock for `slug`: in-process entry first, then the lock
    /// file. Fails with `LockTimeout` after `archive.lock_timeout_ms`.
    pub fn acquire_project_lock(&self, slug: &str) -> Result<ProjectLock<'_>, MailError> {
        ProjectLock::acquire(&self.locks, &self.archive_root(), slug, &self.lock_settings())
    }

    /// Take the commit lock. Only obtainable while holding a project lock.
    pub fn acquire_commit_lock<'p>(
        &'p self,
        project: &'p ProjectLock<'p>,
    ) -> Result<CommitLock<'p>, MailError> {
        CommitLock::acquire(&self.locks, project, &self.lock_settings())
    }
}
