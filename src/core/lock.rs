//! Advisory locks for the archive.
//!
//! Two layers, always taken in this order and released in reverse:
//!
//! 1. an in-process [`LockTable`] entry keyed by lock name, so threads of one
//!    process queue on a condvar instead of spinning on the filesystem;
//! 2. an on-disk [`FileLock`] created with `create_new`, which is what other
//!    processes sharing the archive contend on.
//!
//! The lock file body is owner metadata (`pid`, a ULID token and the creation
//! time). A lock older than the configured staleness threshold is presumed to
//! belong to a crashed holder and is reclaimed with a warning. Release only
//! removes the file while the token on disk is still ours, so a holder whose
//! lock was reclaimed cannot delete its successor's lock.

use crate::core::error::MailError;
use crate::core::time;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use ulid::Ulid;

#[derive(Debug, Clone, Copy)]
pub struct LockSettings {
    pub timeout: Duration,
    pub stale_after: Duration,
    pub retry_base: Duration,
}

impl LockSettings {
    pub fn new(timeout_ms: u64, stale_after_secs: u64) -> Self {
        Self {
            timeout: Duration::from_millis(timeout_ms),
            stale_after: Duration::from_secs(stale_after_secs),
            retry_base: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockOwnerMeta {
    pub pid: u32,
    pub token: String,
    pub created_ts: i64,
}

/// In-process half of the two-level lock.
#[derive(Default)]
pub struct LockTable {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `key` is free or `deadline` passes.
    pub fn acquire(&self, key: &str, deadline: Instant) -> Option<LocalGuard<'_>> {
        let mut held = self.held.lock();
        while held.contains(key) {
            if self.released.wait_until(&mut held, deadline).timed_out() && held.contains(key) {
                return None;
            }
        }
        held.insert(key.to_string());
        Some(LocalGuard {
            table: self,
            key: key.to_string(),
        })
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held.lock().contains(key)
    }
}

pub struct LocalGuard<'a> {
    table: &'a LockTable,
    key: String,
}

impl Drop for LocalGuard<'_> {
    fn drop(&mut self) {
        self.table.held.lock().remove(&self.key);
        self.table.released.notify_all();
    }
}

/// Cross-process advisory lock file.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    token: String,
    held: bool,
}

impl FileLock {
    /// Acquire `path`, reclaiming it if stale, waiting with jittered exponential
    /// backoff until `deadline`.
    pub fn acquire(
        path: &Path,
        settings: &LockSettings,
        deadline: Instant,
    ) -> Result<FileLock, MailError> {
        let start = Instant::now();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let token = Ulid::new().to_string();
        let mut attempt = 0u32;
        loop {
            if try_create(path, &token)? {
                return Ok(FileLock {
                    path: path.to_path_buf(),
                    token,
                    held: true,
                });
            }

            if reclaim_if_stale(path, settings.stale_after)? {
                continue;
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(MailError::LockTimeout(format!(
                    "{} still held after {:.2}s ({} attempts)",
                    path.display(),
                    start.elapsed().as_secs_f64(),
                    attempt + 1
                )));
            }

            let base = settings.retry_base.as_millis() as u64;
            let backoff = base.saturating_mul(1u64 << attempt.min(5));
            let sleep_ms = backoff + jitter_ms(backoff / 2 + 1);
            let remaining = deadline.saturating_duration_since(now);
            std::thread::sleep(Duration::from_millis(sleep_ms).min(remaining));
            attempt += 1;
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn release(&mut self) {
        if !self.held {
            return;
        }
        self.held = false;
        match read_owner(&self.path) {
            Some(meta) if meta.token == self.token => {
                let _ = fs::remove_file(&self.path);
            }
            _ => {
                tracing::warn!(
                    lock = %self.path.display(),
                    "lock was reclaimed by another writer before release; leaving it in place"
                );
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn try_create(path: &Path, token: &str) -> Result<bool, MailError> {
    let meta = LockOwnerMeta {
        pid: std::process::id(),
        token: token.to_string(),
        created_ts: time::now_micros(),
    };
    create_with(path, |file| {
        file.write_all(serde_json::to_string(&meta)?.as_bytes())?;
        file.sync_all()?;
        Ok(())
    })
}

/// Create `path` exclusively and fill it. A failed fill removes the file again,
/// so no ownerless lock is left behind.
fn create_with<F>(path: &Path, fill: F) -> Result<bool, MailError>
where
    F: FnOnce(&mut File) -> Result<(), MailError>,
{
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(false),
        Err(err) => return Err(MailError::IoError(err)),
    };
    if let Err(err) = fill(&mut file) {
        drop(file);
        let _ = fs::remove_file(path);
        return Err(err);
    }
    Ok(true)
}

fn parse_owner(body: &[u8]) -> Option<LockOwnerMeta> {
    serde_json::from_slice(body).ok()
}

pub fn read_owner(path: &Path) -> Option<LockOwnerMeta> {
    fs::read(path).ok().and_then(|body| parse_owner(&body))
}

/// Age of a lock file: owner metadata first, file mtime when the body is
/// missing or unreadable (e.g. a holder that died mid-write).
pub fn lock_age(path: &Path) -> Option<Duration> {
    let body = fs::read(path).ok()?;
    age_of(&body, path)
}

fn age_of(body: &[u8], path: &Path) -> Option<Duration> {
    if let Some(meta) = parse_owner(body) {
        let age_micros = time::now_micros().saturating_sub(meta.created_ts).max(0);
        return Some(Duration::from_micros(age_micros as u64));
    }
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    Some(SystemTime::now().duration_since(modified).unwrap_or_default())
}

/// Remove `path` if it is older than `stale_after`. Returns whether it did.
pub fn reclaim_if_stale(path: &Path, stale_after: Duration) -> Result<bool, MailError> {
    let observed = match fs::read(path) {
        Ok(body) => body,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(MailError::IoError(err)),
    };
    match age_of(&observed, path) {
        Some(age) if age >= stale_after => take_over(path, &observed, stale_after),
        _ => Ok(false),
    }
}

/// Move the lock aside and delete it only if what moved is still the stale
/// lock that was inspected. Anything else is put back.
fn take_over(path: &Path, observed: &[u8], stale_after: Duration) -> Result<bool, MailError> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tombstone = path.with_file_name(format!("{}.{}.reclaim.tmp", name, Ulid::new()));
    match fs::rename(path, &tombstone) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(MailError::IoError(err)),
    }

    let moved = fs::read(&tombstone).unwrap_or_default();
    let age = age_of(&moved, &tombstone);
    if moved == observed && age.is_some_and(|age| age >= stale_after) {
        fs::remove_file(&tombstone)?;
        tracing::warn!(
            lock = %path.display(),
            age_secs = age.unwrap_or_default().as_secs_f64(),
            owner_pid = parse_owner(&moved).map(|m| m.pid),
            "reclaimed stale archive lock"
        );
        return Ok(true);
    }

    // The lock was replaced after inspection; hand it back to its owner.
    match fs::hard_link(&tombstone, path) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            tracing::warn!(
                lock = %path.display(),
                "lock re-created while restoring a live lock; keeping the newer one"
            );
        }
        Err(err) => {
            let _ = fs::rename(&tombstone, path);
            return Err(MailError::IoError(err));
        }
    }
    fs::remove_file(&tombstone)?;
    Ok(false)
}

fn jitter_ms(max_exclusive: u64) -> u64 {
    if max_exclusive <= 1 {
        return 0;
    }
    let now_ns = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    now_ns % max_exclusive
}

/// Scoped handle for a project's archive directory. While it lives, this
/// process (and, through the lock file, every other process) is the only writer
/// of the project's documents.
pub struct ProjectLock<'a> {
    slug: String,
    project_dir: PathBuf,
    repo_root: PathBuf,
    pending: Vec<PathBuf>,
    // Field order is release order: file lock first, then the in-process entry.
    _file: FileLock,
    _local: LocalGuard<'a>,
}

impl<'a> ProjectLock<'a> {
    pub fn acquire(
        table: &'a LockTable,
        repo_root: &Path,
        slug: &str,
        settings: &LockSettings,
    ) -> Result<ProjectLock<'a>, MailError> {
        let deadline = Instant::now() + settings.timeout;
        let project_dir = repo_root.join("projects").join(slug);
        let lock_path = project_dir.join(PROJECT_LOCK_FILE);
        let local = table
            .acquire(&format!("project:{}", slug), deadline)
            .ok_or_else(|| {
                MailError::LockTimeout(format!(
                    "project '{}' lock held in-process for more than {}ms",
                    slug,
                    settings.timeout.as_millis()
                ))
            })?;
        let file = FileLock::acquire(&lock_path, settings, deadline)?;
        Ok(ProjectLock {
            slug: slug.to_string(),
            project_dir,
            repo_root: repo_root.to_path_buf(),
            pending: Vec::new(),
            _file: file,
            _local: local,
        })
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Paths written under this lock, relative to the repository root.
    pub fn pending(&self) -> &[PathBuf] {
        &self.pending
    }

    pub(crate) fn record_pending(&mut self, rel_to_repo: PathBuf) {
        if !self.pending.contains(&rel_to_repo) {
            self.pending.push(rel_to_repo);
        }
    }

    pub(crate) fn clear_pending(&mut self) {
        self.pending.clear();
    }
}

/// Process-wide (and cross-process) serializer for the stage + commit step.
/// Borrowing the [`ProjectLock`] makes project-then-commit the only possible
/// acquisition order, and guarantees the commit lock is gone before the
/// project lock can be released.
pub struct CommitLock<'p> {
    _file: FileLock,
    _local: LocalGuard<'p>,
    _project: std::marker::PhantomData<&'p ()>,
}

impl<'p> CommitLock<'p> {
    pub fn acquire<'a: 'p>(
        table: &'p LockTable,
        project: &'p ProjectLock<'a>,
        settings: &LockSettings,
    ) -> Result<CommitLock<'p>, MailError> {
        let deadline = Instant::now() + settings.timeout;
        let local = table.acquire(COMMIT_LOCK_KEY, deadline).ok_or_else(|| {
            MailError::LockTimeout(format!(
                "commit lock held in-process for more than {}ms",
                settings.timeout.as_millis()
            ))
        })?;
        let file = FileLock::acquire(
            &project.repo_root().join(COMMIT_LOCK_FILE),
            settings,
            deadline,
        )?;
        Ok(CommitLock {
            _file: file,
            _local: local,
            _project: std::marker::PhantomData,
        })
    }
}

pub const PROJECT_LOCK_FILE: &str = ".archive.lock";
pub const COMMIT_LOCK_FILE: &str = ".commit.lock";
const COMMIT_LOCK_KEY: &str = "commit";
