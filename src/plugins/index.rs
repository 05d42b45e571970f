//! Index store: message rows, per-recipient state and full-text search.
//!
//! Functions here take a borrowed connection or transaction so the delivery
//! pipeline can compose them inside one `IMMEDIATE` transaction.

use crate::core::error::MailError;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_LIMIT: usize = 20;
pub const MAX_LIMIT: usize = 200;

/// Thread key of a row: its `thread_id`, else its own id as text.
const THREAD_KEY_SQL: &str = "COALESCE(m.thread_id, CAST(m.id AS TEXT))";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Importance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Importance::Low => "low",
            Importance::Normal => "normal",
            Importance::High => "high",
            Importance::Urgent => "urgent",
        }
    }
}

impl fmt::Display for Importance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Importance {
    type Err = MailError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Importance::Low),
            "normal" => Ok(Importance::Normal),
            "high" => Ok(Importance::High),
            "urgent" => Ok(Importance::Urgent),
            other => Err(MailError::ValidationError(format!(
                "unknown importance '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientKind {
    To,
    Cc,
    Bcc,
}

impl RecipientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientKind::To => "to",
            RecipientKind::Cc => "cc",
            RecipientKind::Bcc => "bcc",
        }
    }

    fn from_stored(raw: &str) -> Self {
        match raw {
            "cc" => RecipientKind::Cc,
            "bcc" => RecipientKind::Bcc,
            _ => RecipientKind::To,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub project_id: i64,
    pub sender_id: i64,
    pub thread_id: Option<String>,
    pub subject: String,
    pub body_md: String,
    pub importance: Importance,
    pub ack_required: bool,
    pub created_ts: i64,
    pub dedupe_key: String,
    pub recipients: Vec<(i64, RecipientKind)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientRecord {
    pub agent: String,
    pub kind: RecipientKind,
    pub read_ts: Option<i64>,
    pub ack_ts: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: i64,
    pub project_id: i64,
    pub sender: String,
    pub thread_id: Option<String>,
    pub thread_key: String,
    pub subject: String,
    pub body_md: String,
    pub importance: Importance,
    pub ack_required: bool,
    pub created_ts: i64,
    pub recipients: Vec<RecipientRecord>,
}

impl MessageRecord {
    pub fn names_of(&self, kind: RecipientKind) -> Vec<String> {
        self.recipients
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| r.agent.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InboxQuery {
    pub unread_only: bool,
    /// Only `high` and `urgent` messages.
    pub urgent_only: bool,
    pub since_ts: Option<i64>,
    pub limit: Option<usize>,
    pub include_bodies: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxItem {
    pub id: i64,
    pub sender: String,
    pub subject: String,
    pub body_md: Option<String>,
    pub thread_key: String,
    pub importance: Importance,
    pub ack_required: bool,
    pub created_ts: i64,
    pub kind: RecipientKind,
    pub read_ts: Option<i64>,
    pub ack_ts: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchQuery {
    pub text: String,
    /// Project human key or slug.
    pub project: Option<String>,
    /// Sender or recipient name.
    pub agent: Option<String>,
    pub thread: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: i64,
    pub project: String,
    pub sender: String,
    pub subject: String,
    pub snippet: String,
    pub thread_key: String,
    pub created_ts: i64,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientState {
    pub message_id: i64,
    pub agent_id: i64,
    pub read_ts: Option<i64>,
    pub ack_ts: Option<i64>,
    /// False when the timestamp was already set.
    pub changed: bool,
}

pub fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

pub fn insert_message(conn: &Connection, msg: &NewMessage) -> Result<i64, MailError> {
    conn.execute(
        "INSERT INTO messages(project_id, sender_id, thread_id, subject, body_md, importance, ack_required, created_ts, dedupe_key)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            msg.project_id,
            msg.sender_id,
            msg.thread_id,
            msg.subject,
            msg.body_md,
            msg.importance.as_str(),
            msg.ack_required,
            msg.created_ts,
            msg.dedupe_key
        ],
    )?;
    let id = conn.last_insert_rowid();
    let mut stmt = conn.prepare_cached(
        "INSERT INTO message_recipients(message_id, agent_id, kind) VALUES(?1, ?2, ?3)",
    )?;
    for (agent_id, kind) in &msg.recipients {
        stmt.execute(params![id, agent_id, kind.as_str()])?;
    }
    Ok(id)
}

/// Id of an identical message sent by `sender_id` at or after `since`.
pub fn find_duplicate(
    conn: &Connection,
    project_id: i64,
    sender_id: i64,
    dedupe_key: &str,
    since: i64,
) -> Result<Option<i64>, MailError> {
    Ok(conn
        .query_row(
            "SELECT id FROM messages
             WHERE project_id = ?1 AND sender_id = ?2 AND dedupe_key = ?3 AND created_ts >= ?4
             ORDER BY id LIMIT 1",
            params![project_id, sender_id, dedupe_key, since],
            |r| r.get(0),
        )
        .optional()?)
}

fn load_recipients(conn: &Connection, message_id: i64) -> Result<Vec<RecipientRecord>, MailError> {
    let mut stmt = conn.prepare_cached(
        "SELECT a.name, r.kind, r.read_ts, r.ack_ts
         FROM message_recipients r JOIN agents a ON a.id = r.agent_id
         WHERE r.message_id = ?1 ORDER BY r.rowid",
    )?;
    let rows = stmt
        .query_map(params![message_id], |row| {
            let kind: String = row.get(1)?;
            Ok(RecipientRecord {
                agent: row.get(0)?,
                kind: RecipientKind::from_stored(&kind),
                read_ts: row.get(2)?,
                ack_ts: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    let importance: String = row.get(7)?;
    Ok(MessageRecord {
        id: row.get(0)?,
        project_id: row.get(1)?,
        sender: row.get(2)?,
        thread_id: row.get(3)?,
        thread_key: row.get(4)?,
        subject: row.get(5)?,
        body_md: row.get(6)?,
        importance: importance.parse().unwrap_or_default(),
        ack_required: row.get::<_, i64>(8)? != 0,
        created_ts: row.get(9)?,
        recipients: Vec::new(),
    })
}

fn message_select() -> String {
    format!(
        "SELECT m.id, m.project_id, s.name, m.thread_id, {}, m.subject, m.body_md, m.importance, m.ack_required, m.created_ts
         FROM messages m JOIN agents s ON s.id = m.sender_id",
        THREAD_KEY_SQL
    )
}

pub fn get_message(conn: &Connection, project_id: i64, id: i64) -> Result<MessageRecord, MailError> {
    let mut record = conn
        .query_row(
            &format!("{} WHERE m.project_id = ?1 AND m.id = ?2", message_select()),
            params![project_id, id],
            message_from_row,
        )
        .optional()?
        .ok_or_else(|| MailError::not_found("message", id.to_string()))?;
    record.recipients = load_recipients(conn, id)?;
    Ok(record)
}

/// Every message in a thread, oldest first.
pub fn thread_messages(
    conn: &Connection,
    project_id: i64,
    thread_key: &str,
) -> Result<Vec<MessageRecord>, MailError> {
    let mut stmt = conn.prepare(&format!(
        "{} WHERE m.project_id = ?1 AND {} = ?2 ORDER BY m.id",
        message_select(),
        THREAD_KEY_SQL
    ))?;
    let mut records = stmt
        .query_map(params![project_id, thread_key], message_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    for record in records.iter_mut() {
        record.recipients = load_recipients(conn, record.id)?;
    }
    Ok(records)
}

/// Messages addressed to `agent_id`, newest first.
pub fn fetch_inbox(
    conn: &Connection,
    project_id: i64,
    agent_id: i64,
    query: &InboxQuery,
) -> Result<Vec<InboxItem>, MailError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT m.id, s.name, m.subject, m.body_md, {}, m.importance, m.ack_required, m.created_ts,
                r.kind, r.read_ts, r.ack_ts
         FROM message_recipients r
         JOIN messages m ON m.id = r.message_id
         JOIN agents s ON s.id = m.sender_id
         WHERE m.project_id = ?1 AND r.agent_id = ?2
           AND (?3 = 0 OR r.read_ts IS NULL)
           AND (?4 = 0 OR m.importance IN ('high', 'urgent'))
           AND (?5 IS NULL OR m.created_ts > ?5)
         ORDER BY m.id DESC
         LIMIT ?6",
        THREAD_KEY_SQL
    ))?;
    let include_bodies = query.include_bodies;
    let items = stmt
        .query_map(
            params![
                project_id,
                agent_id,
                query.unread_only,
                query.urgent_only,
                query.since_ts,
                clamp_limit(query.limit) as i64
            ],
            |row| {
                let importance: String = row.get(5)?;
                let kind: String = row.get(8)?;
                Ok(InboxItem {
                    id: row.get(0)?,
                    sender: row.get(1)?,
                    subject: row.get(2)?,
                    body_md: if include_bodies { Some(row.get(3)?) } else { None },
                    thread_key: row.get(4)?,
                    importance: importance.parse().unwrap_or_default(),
                    ack_required: row.get::<_, i64>(6)? != 0,
                    created_ts: row.get(7)?,
                    kind: RecipientKind::from_stored(&kind),
                    read_ts: row.get(9)?,
                    ack_ts: row.get(10)?,
                })
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items)
}

fn recipient_state(
    conn: &Connection,
    message_id: i64,
    agent_id: i64,
    changed: bool,
) -> Result<RecipientState, MailError> {
    conn.query_row(
        "SELECT read_ts, ack_ts FROM message_recipients WHERE message_id = ?1 AND agent_id = ?2",
        params![message_id, agent_id],
        |r| {
            Ok(RecipientState {
                message_id,
                agent_id,
                read_ts: r.get(0)?,
                ack_ts: r.get(1)?,
                changed,
            })
        },
    )
    .optional()?
    .ok_or_else(|| MailError::not_found("recipient", format!("message {} agent {}", message_id, agent_id)))
}

/// Set `read_ts` if unset. The first read wins.
pub fn mark_read(conn: &Connection, message_id: i64, agent_id: i64, now: i64) -> Result<RecipientState, MailError> {
    let updated = conn.execute(
        "UPDATE message_recipients SET read_ts = ?3
         WHERE message_id = ?1 AND agent_id = ?2 AND read_ts IS NULL",
        params![message_id, agent_id, now],
    )?;
    recipient_state(conn, message_id, agent_id, updated > 0)
}

/// Set `ack_ts` (and `read_ts`, if still unset). The first acknowledgement wins.
pub fn mark_acknowledged(
    conn: &Connection,
    message_id: i64,
    agent_id: i64,
    now: i64,
) -> Result<RecipientState, MailError> {
    let updated = conn.execute(
        "UPDATE message_recipients SET ack_ts = ?3, read_ts = COALESCE(read_ts, ?3)
         WHERE message_id = ?1 AND agent_id = ?2 AND ack_ts IS NULL",
        params![message_id, agent_id, now],
    )?;
    recipient_state(conn, message_id, agent_id, updated > 0)
}

fn is_operator(token: &str) -> bool {
    matches!(token, "AND" | "OR" | "NOT")
}

/// Turn free text into an FTS5 expression: bare tokens are quoted, `AND`/`OR`/
/// `NOT` pass through between terms, and a trailing `*` becomes a prefix
/// query. Returns `None` when nothing searchable remains.
pub fn sanitize_fts_query(raw: &str) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();
    for token in raw.split_whitespace() {
        if is_operator(token) {
            if parts.last().is_some_and(|p| !is_operator(p)) {
                parts.push(token.to_string());
            }
            continue;
        }
        let prefix = token.ends_with('*');
        let cleaned: String = token
            .chars()
            .filter(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | '\''))
            .collect();
        let cleaned = cleaned.trim_matches(|c: char| matches!(c, '-' | '.' | '/' | '\''));
        if cleaned.is_empty() {
            continue;
        }
        let quoted = format!("\"{}\"", cleaned);
        parts.push(if prefix { format!("{}*", quoted) } else { quoted });
    }
    while parts.last().is_some_and(|p| is_operator(p)) {
        parts.pop();
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

/// Ranked full-text search across subjects and bodies; subject matches weigh
/// more. Ties go to the newest message.
pub fn search_messages(conn: &Connection, query: &SearchQuery) -> Result<Vec<SearchHit>, MailError> {
    let Some(expr) = sanitize_fts_query(&query.text) else {
        return Err(MailError::ValidationError(
            "search text must contain at least one searchable term".to_string(),
        ));
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT m.id, p.slug, s.name, m.subject,
                snippet(fts_messages, 2, '[', ']', '...', 12),
                {}, m.created_ts, bm25(fts_messages, 0.0, 10.0, 1.0) AS score
         FROM fts_messages
         JOIN messages m ON m.id = fts_messages.message_id
         JOIN projects p ON p.id = m.project_id
         JOIN agents s ON s.id = m.sender_id
         WHERE fts_messages MATCH ?1
           AND (?2 IS NULL OR p.slug = ?2 OR p.human_key = ?2)
           AND (?3 IS NULL OR s.name = ?3 OR EXISTS(
                SELECT 1 FROM message_recipients r JOIN agents ra ON ra.id = r.agent_id
                WHERE r.message_id = m.id AND ra.name = ?3))
           AND (?4 IS NULL OR {} = ?4)
         ORDER BY score, m.id DESC
         LIMIT ?5",
        THREAD_KEY_SQL, THREAD_KEY_SQL
    ))?;
    let hits = stmt
        .query_map(
            params![
                expr,
                query.project,
                query.agent,
                query.thread,
                clamp_limit(query.limit) as i64
            ],
            |row| {
                Ok(SearchHit {
                    id: row.get(0)?,
                    project: row.get(1)?,
                    sender: row.get(2)?,
                    subject: row.get(3)?,
                    snippet: row.get(4)?,
                    thread_key: row.get(5)?,
                    created_ts: row.get(6)?,
                    score: row.get(7)?,
                })
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(hits)
}
