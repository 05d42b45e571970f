//! Archive store: the git-backed, human-auditable document mirror.
//!
//! The index is authoritative. Every mutation commits to the index first and
//! then mirrors documents here through [`mirror`], which takes the project lock,
//! writes, takes the commit lock, stages and commits, and releases in reverse.
//! Failures are retried with backoff and finally reported as
//! [`Durability::ArchiveWriteDegraded`] instead of an error.

use crate::core::error::MailError;
use crate::core::lock::{self, CommitLock, ProjectLock};
use crate::core::store::Store;
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Output};
use std::time::{Duration, Instant};

const GITATTRIBUTES: &str = "*.json text eol=lf\n*.md text eol=lf\n";
const GITIGNORE: &str = "*.lock\n*.tmp\n";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitId(pub String);

impl std::fmt::Display for CommitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of the archive half of a two-phase write. The index half has
/// already committed whenever a `Durability` exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Durability {
    Durable { commit: CommitId },
    ArchiveWriteDegraded { reason: String },
}

impl Durability {
    pub fn is_durable(&self) -> bool {
        matches!(self, Durability::Durable { .. })
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Durability::ArchiveWriteDegraded { .. })
    }
}

/// Result of a mutating operation: the index value plus the mirror outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Committed<T> {
    pub value: T,
    pub durability: Durability,
}

impl<T> Committed<T> {
    pub fn new(value: T, durability: Durability) -> Self {
        Self { value, durability }
    }
}

// --- git plumbing -----------------------------------------------------------

fn git_output(repo_root: &Path, args: &[&str]) -> Result<Output, MailError> {
    Command::new("git")
        .args(args)
        .current_dir(repo_root)
        .output()
        .map_err(|e| MailError::HistoryError(format!("git failed to start: {}", e)))
}

pub fn run_git(repo_root: &Path, args: &[&str]) -> Result<String, MailError> {
    let output = git_output(repo_root, args)?;
    if !output.status.success() {
        return Err(MailError::HistoryError(format!(
            "git {} failed: {}",
            args.first().copied().unwrap_or_default(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn identity_args(store: &Store) -> Vec<String> {
    vec![
        "-c".to_string(),
        format!("user.name={}", store.config.archive.git_author_name),
        "-c".to_string(),
        format!("user.email={}", store.config.archive.git_author_email),
        "-c".to_string(),
        "commit.gpgsign=false".to_string(),
    ]
}

fn commit_args<'a>(identity: &'a [String], message: &'a str, paths: &[&'a str]) -> Vec<&'a str> {
    let mut args: Vec<&str> = identity.iter().map(String::as_str).collect();
    args.extend(["commit", "--no-verify", "-q", "-m", message, "--only", "--"]);
    args.extend(paths);
    args
}

pub fn head(store: &Store) -> Result<CommitId, MailError> {
    run_git(&store.archive_root(), &["rev-parse", "HEAD"]).map(CommitId)
}

/// Durability of an operation that wrote nothing new: as durable as `HEAD`.
pub fn current_durability(store: &Store) -> Durability {
    match head(store) {
        Ok(commit) => Durability::Durable { commit },
        Err(err) => Durability::ArchiveWriteDegraded {
            reason: err.to_string(),
        },
    }
}

/// Initialise the archive repository if needed. Idempotent and safe against
/// a concurrent initialiser in another process.
pub fn ensure_archive(store: &Store) -> Result<(), MailError> {
    let repo = store.archive_root();
    if repo.join(".git").is_dir() {
        return Ok(());
    }
    fs::create_dir_all(&repo)?;

    let settings = store.lock_settings();
    let _guard = lock::FileLock::acquire(
        &repo.join(lock::COMMIT_LOCK_FILE),
        &settings,
        Instant::now() + settings.timeout,
    )?;
    if repo.join(".git").is_dir() {
        return Ok(());
    }

    run_git(&repo, &["init", "-q"])?;
    fs::write(repo.join(".gitattributes"), GITATTRIBUTES)?;
    fs::write(repo.join(".gitignore"), GITIGNORE)?;
    run_git(&repo, &["add", ".gitattributes", ".gitignore"])?;
    let identity = identity_args(store);
    let args = commit_args(
        &identity,
        "mailroom: initialise archive",
        &[".gitattributes", ".gitignore"],
    );
    run_git(&repo, &args)?;
    tracing::info!(archive = %repo.display(), "initialised archive repository");
    Ok(())
}

// --- documents --------------------------------------------------------------

fn validate_relative(rel: &Path) -> Result<(), MailError> {
    if rel.as_os_str().is_empty() {
        return Err(MailError::ValidationError("empty document path".to_string()));
    }
    for component in rel.components() {
        match component {
            Component::Normal(_) => {}
            Component::CurDir => {}
            _ => {
                return Err(MailError::ValidationError(format!(
                    "document path '{}' must be relative and stay inside the project",
                    rel.display()
                )));
            }
        }
    }
    Ok(())
}

/// Write `content` to `rel` under the locked project directory (temp file and
/// rename) and record it as pending for the next commit.
pub fn write_document(
    lock: &mut ProjectLock<'_>,
    rel: impl AsRef<Path>,
    content: &str,
) -> Result<PathBuf, MailError> {
    let rel = rel.as_ref();
    validate_relative(rel)?;
    let target = lock.project_dir().join(rel);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = target.with_file_name(format!(".{}.{}.tmp", file_name, ulid::Ulid::new()));
    fs::write(&tmp, content)?;
    if let Err(err) = fs::rename(&tmp, &target) {
        let _ = fs::remove_file(&tmp);
        return Err(err.into());
    }
    let rel_to_repo = Path::new("projects").join(lock.slug()).join(rel);
    lock.record_pending(rel_to_repo);
    Ok(target)
}

pub fn write_json_document<T: Serialize>(
    lock: &mut ProjectLock<'_>,
    rel: impl AsRef<Path>,
    value: &T,
) -> Result<PathBuf, MailError> {
    let mut body = serde_json::to_string_pretty(value)?;
    body.push('\n');
    write_document(lock, rel, &body)
}

/// Stage and commit the locked project's directory. Returns the new `HEAD`, or
/// the current one when nothing changed.
pub fn commit(
    store: &Store,
    project: &ProjectLock<'_>,
    _commit_lock: &CommitLock<'_>,
    message: &str,
) -> Result<CommitId, MailError> {
    let repo = project.repo_root();
    let scope = format!("projects/{}", project.slug());
    run_git(repo, &["add", "-A", "--", &scope])?;

    let diff = git_output(repo, &["diff", "--cached", "--quiet", "--", &scope])?;
    if diff.status.success() {
        return head(store);
    }

    let identity = identity_args(store);
    let args = commit_args(&identity, message, &[scope.as_str()]);
    run_git(repo, &args)?;
    head(store)
}

fn mirror_once<F>(store: &Store, slug: &str, message: &str, write: &mut F) -> Result<CommitId, MailError>
where
    F: FnMut(&mut ProjectLock<'_>) -> Result<(), MailError>,
{
    ensure_archive(store)?;
    let mut project = store.acquire_project_lock(slug)?;
    write(&mut project)?;
    let commit_lock = store.acquire_commit_lock(&project)?;
    let id = commit(store, &project, &commit_lock, message)?;
    drop(commit_lock);
    project.clear_pending();
    Ok(id)
}

/// Mirror a committed index change into the archive with bounded retries.
/// Never fails: exhaustion is reported as `ArchiveWriteDegraded`.
pub fn mirror<F>(store: &Store, slug: &str, message: &str, mut write: F) -> Durability
where
    F: FnMut(&mut ProjectLock<'_>) -> Result<(), MailError>,
{
    let attempts = store.config.archive.mirror_retries.max(1);
    let base = store.config.archive.retry_base_ms;
    let mut reason = String::new();
    for attempt in 0..attempts {
        match mirror_once(store, slug, message, &mut write) {
            Ok(commit) => return Durability::Durable { commit },
            Err(err) => {
                tracing::debug!(project = slug, attempt, error = %err, "archive mirror attempt failed");
                reason = err.to_string();
                if attempt + 1 < attempts {
                    let delay = base.saturating_mul(1u64 << attempt.min(6));
                    std::thread::sleep(Duration::from_millis(delay));
                }
            }
        }
    }
    tracing::warn!(project = slug, attempts, reason = %reason, "archive write degraded; index remains authoritative");
    Durability::ArchiveWriteDegraded { reason }
}

/// Lower-case `text`, collapse runs of anything outside `[a-z0-9]` into one
/// `-`, trim dashes and cut to `max_len` characters.
pub fn slugify(text: &str, max_len: usize) -> String {
    let mut out = String::with_capacity(text.len());
    let mut dash = false;
    for ch in text.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            out.push(ch);
            dash = false;
        } else if !dash && !out.is_empty() {
            out.push('-');
            dash = true;
        }
    }
    let mut slug: String = out.chars().take(max_len).collect();
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

pub fn subject_slug(subject: &str) -> String {
    let slug = slugify(subject, 80);
    if slug.is_empty() {
        "message".to_string()
    } else {
        slug
    }
}

/// `<YYYY-MM-DDTHH-MM-SSZ>__<subject-slug>__<id>.md`
pub fn message_file_name(created_ts: i64, subject: &str, id: i64) -> String {
    format!(
        "{}__{}__{}.md",
        time::path_stamp(created_ts),
        subject_slug(subject),
        id
    )
}

fn dated(dir: &Path, created_ts: i64, file_name: &str) -> PathBuf {
    let (year, month) = time::year_month(created_ts);
    dir.join(year).join(month).join(file_name)
}

/// Canonical message document path, relative to the project directory.
pub fn canonical_message_path(created_ts: i64, subject: &str, id: i64) -> PathBuf {
    dated(
        Path::new("messages"),
        created_ts,
        &message_file_name(created_ts, subject, id),
    )
}

pub fn inbox_message_path(agent: &str, created_ts: i64, subject: &str, id: i64) -> PathBuf {
    dated(
        &Path::new("agents").join(agent).join("inbox"),
        created_ts,
        &message_file_name(created_ts, subject, id),
    )
}

pub fn outbox_message_path(agent: &str, created_ts: i64, subject: &str, id: i64) -> PathBuf {
    dated(
        &Path::new("agents").join(agent).join("outbox"),
        created_ts,
        &message_file_name(created_ts, subject, id),
    )
}

pub fn receipt_path(created_ts: i64, subject: &str, id: i64, agent: &str) -> PathBuf {
    let canonical = canonical_message_path(created_ts, subject, id);
    let mut receipts = canonical.into_os_string();
    receipts.push(".receipts");
    PathBuf::from(receipts).join(format!("{}.json", agent))
}

pub fn profile_path(agent: &str) -> PathBuf {
    Path::new("agents").join(agent).join("profile.json")
}

pub fn reservation_path(id: i64) -> PathBuf {
    Path::new("file_reservations").join(format!("id-{}.json", id))
}

pub fn contact_path(from: &str, to: &str) -> PathBuf {
    Path::new("contacts").join(format!("{}__{}.json", from, to))
}

pub const PROJECT_DOC: &str = "project.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageFrontMatter {
    pub id: i64,
    pub project: String,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bcc: Vec<String>,
    pub subject: String,
    pub thread_id: Option<String>,
    pub importance: String,
    pub ack_required: bool,
    pub created: String,
}

impl MessageFrontMatter {
    /// Copy for recipients: blind-copied names are not disclosed.
    pub fn without_bcc(&self) -> Self {
        Self {
            bcc: Vec::new(),
            ..self.clone()
        }
    }
}

/// `---json\n<front matter>\n---\n\n<body>\n`
pub fn render_message_document(front: &MessageFrontMatter, body: &str) -> Result<String, MailError> {
    let json = serde_json::to_string_pretty(front)?;
    Ok(format!("---json\n{}\n---\n\n{}\n", json, body.trim_end()))
}

pub fn parse_message_document(content: &str) -> Result<(MessageFrontMatter, String), MailError> {
    let rest = content
        .strip_prefix("---json\n")
        .ok_or_else(|| MailError::ValidationError("missing ---json front matter".to_string()))?;
    let (json, body) = rest
        .split_once("\n---\n")
        .ok_or_else(|| MailError::ValidationError("unterminated front matter".to_string()))?;
    let front: MessageFrontMatter = serde_json::from_str(json)?;
    Ok((front, body.trim_start_matches('\n').trim_end().to_string()))
}

// --- maintenance ------------------------------------------------------------

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct HealReport {
    pub scanned: usize,
    pub reclaimed: Vec<PathBuf>,
    pub held: Vec<PathBuf>,
}

/// Reclaim stale `*.lock` files anywhere in the archive.
pub fn heal_locks(store: &Store) -> Result<HealReport, MailError> {
    let mut report = HealReport::default();
    let root = store.archive_root();
    if !root.is_dir() {
        return Ok(report);
    }
    let stale_after = Duration::from_secs(store.config.archive.stale_lock_secs);
    let mut stack = vec![root];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                if entry.file_name() != ".git" {
                    stack.push(path);
                }
                continue;
            }
            if path.extension().is_some_and(|ext| ext == "lock") {
                report.scanned += 1;
                if lock::reclaim_if_stale(&path, stale_after)? {
                    report.reclaimed.push(path);
                } else {
                    report.held.push(path);
                }
            }
        }
    }
    Ok(report)
}
