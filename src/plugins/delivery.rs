//! Delivery pipeline: send, reply, inbox reads, read/ack receipts.
//!
//! A send is two-phase. Phase one is a single index transaction (policy
//! re-check, dedupe, message and recipient rows, FTS through triggers); once it
//! commits the message exists. Phase two mirrors the documents into the
//! archive and can only degrade, never fail the send.

use crate::core::error::MailError;
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::archive::{self, Committed, Durability, MessageFrontMatter};
use crate::plugins::contacts;
use crate::plugins::index::{
    self, Importance, InboxItem, InboxQuery, MessageRecord, NewMessage, RecipientKind,
    RecipientState, SearchHit, SearchQuery,
};
use crate::plugins::registry::{self, Agent, Project};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendRequest {
    /// Project human key or slug.
    pub project: String,
    pub sender: String,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    pub subject: String,
    #[serde(default)]
    pub body_md: String,
    #[serde(default)]
    pub importance: Importance,
    #[serde(default)]
    pub ack_required: bool,
    #[serde(default)]
    pub thread_id: Option<String>,
    /// Distinguishes intentional repeats from retries of the same send.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplyRequest {
    pub project: String,
    pub sender: String,
    pub message_id: i64,
    #[serde(default)]
    pub body_md: String,
    /// Defaults to the original sender.
    #[serde(default)]
    pub to: Option<Vec<String>>,
    #[serde(default)]
    pub cc: Vec<String>,
    /// Defaults to the original importance.
    #[serde(default)]
    pub importance: Option<Importance>,
    #[serde(default)]
    pub ack_required: bool,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendReceipt {
    pub message: MessageRecord,
    /// True when an identical send inside the dedupe window was found and
    /// nothing new was written.
    pub deduplicated: bool,
}

#[derive(Debug, Serialize)]
struct ReceiptDocument<'a> {
    message_id: i64,
    agent: &'a str,
    read: Option<String>,
    acknowledged: Option<String>,
}

/// Deduplicate recipients by name (case-insensitive), keeping the first
/// occurrence in to, cc, bcc order.
fn collect_recipients(req: &SendRequest) -> Vec<(String, RecipientKind)> {
    let mut out: Vec<(String, RecipientKind)> = Vec::new();
    let lists = [
        (&req.to, RecipientKind::To),
        (&req.cc, RecipientKind::Cc),
        (&req.bcc, RecipientKind::Bcc),
    ];
    for (names, kind) in lists {
        for name in names {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            if !out.iter().any(|(n, _)| n.eq_ignore_ascii_case(name)) {
                out.push((name.to_string(), kind));
            }
        }
    }
    out
}

fn validate(store: &Store, req: &SendRequest) -> Result<(String, Vec<(String, RecipientKind)>), MailError> {
    let cfg = &store.config.delivery;
    let subject = req.subject.trim().to_string();
    if subject.is_empty() {
        return Err(MailError::ValidationError("subject must not be empty".to_string()));
    }
    let chars = subject.chars().count();
    if chars > cfg.max_subject_chars {
        return Err(MailError::ValidationError(format!(
            "subject is {} characters; the limit is {}",
            chars, cfg.max_subject_chars
        )));
    }
    let recipients = collect_recipients(req);
    if recipients.is_empty() {
        return Err(MailError::ValidationError(
            "at least one recipient is required across to, cc and bcc".to_string(),
        ));
    }
    if recipients.len() > cfg.max_recipients {
        return Err(MailError::ValidationError(format!(
            "{} recipients exceeds the limit of {}",
            recipients.len(),
            cfg.max_recipients
        )));
    }
    Ok((subject, recipients))
}

pub fn dedupe_key(
    sender: &str,
    subject: &str,
    body: &str,
    thread_id: Option<&str>,
    recipients: &[(String, RecipientKind)],
    idempotency_key: Option<&str>,
) -> String {
    let mut names: Vec<String> = recipients.iter().map(|(n, _)| n.to_lowercase()).collect();
    names.sort();
    let mut hasher = Sha256::new();
    for part in [
        sender.to_lowercase().as_str(),
        subject,
        body,
        thread_id.unwrap_or_default(),
        names.join(",").as_str(),
        idempotency_key.unwrap_or_default(),
    ] {
        hasher.update(part.as_bytes());
        hasher.update(b"\x1f");
    }
    format!("{:x}", hasher.finalize())
}

struct Resolved {
    project: Project,
    sender: Agent,
    recipients: Vec<(Agent, RecipientKind)>,
}

/// Resolve names to active agents and run the contact policy for each
/// recipient. The first missing agent or rejection wins.
fn resolve_and_admit(
    conn: &Connection,
    store: &Store,
    project_key: &str,
    sender: &str,
    recipients: &[(String, RecipientKind)],
    now: i64,
) -> Result<Resolved, MailError> {
    let project = registry::find_project(conn, project_key)?;
    let sender = registry::find_active_agent(conn, project.id, sender)?;
    let mut resolved = Vec::with_capacity(recipients.len());
    for (name, kind) in recipients {
        resolved.push((registry::find_active_agent(conn, project.id, name)?, *kind));
    }
    for (recipient, _) in &resolved {
        contacts::evaluate(conn, &store.config.contact, &sender, recipient, now)?
            .into_result(&sender.name, &recipient.name)?;
    }
    Ok(Resolved {
        project,
        sender,
        recipients: resolved,
    })
}

fn mirror_message(store: &Store, slug: &str, message: &MessageRecord) -> Durability {
    let front = MessageFrontMatter {
        id: message.id,
        project: slug.to_string(),
        from: message.sender.clone(),
        to: message.names_of(RecipientKind::To),
        cc: message.names_of(RecipientKind::Cc),
        bcc: message.names_of(RecipientKind::Bcc),
        subject: message.subject.clone(),
        thread_id: message.thread_id.clone(),
        importance: message.importance.to_string(),
        ack_required: message.ack_required,
        created: time::to_rfc3339(message.created_ts),
    };
    let commit_message = format!(
        "mail: {} -> {}: {}",
        message.sender,
        message
            .recipients
            .iter()
            .filter(|r| r.kind != RecipientKind::Bcc)
            .map(|r| r.agent.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        message.subject
    );
    archive::mirror(store, slug, &commit_message, |lock| {
        let (ts, subject, id) = (message.created_ts, message.subject.as_str(), message.id);
        let full = archive::render_message_document(&front, &message.body_md)?;
        let public = archive::render_message_document(&front.without_bcc(), &message.body_md)?;
        archive::write_document(lock, archive::canonical_message_path(ts, subject, id), &full)?;
        archive::write_document(
            lock,
            archive::outbox_message_path(&message.sender, ts, subject, id),
            &full,
        )?;
        for recipient in &message.recipients {
            archive::write_document(
                lock,
                archive::inbox_message_path(&recipient.agent, ts, subject, id),
                &public,
            )?;
        }
        Ok(())
    })
}

/// Send a message. Validation and policy errors happen before anything is
/// written; after the index commit the send has succeeded regardless of the
/// archive outcome.
pub fn send_message(store: &Store, req: &SendRequest) -> Result<Committed<SendReceipt>, MailError> {
    let (subject, recipients) = validate(store, req)?;
    let thread_id = req
        .thread_id
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string);
    let now = time::now_micros();

    // Fail fast on a snapshot before queueing for the write lock.
    store
        .pool()
        .with_read(|conn| resolve_and_admit(conn, store, &req.project, &req.sender, &recipients, now))?;

    let key = dedupe_key(
        &req.sender,
        &subject,
        &req.body_md,
        thread_id.as_deref(),
        &recipients,
        req.idempotency_key.as_deref(),
    );
    let window = store.config.delivery.dedupe_window_secs;

    let (slug, message, deduplicated) = store.pool().with_transaction(|tx| {
        let resolved = resolve_and_admit(tx, store, &req.project, &req.sender, &recipients, now)?;
        if window > 0 {
            let since = now.saturating_sub(time::secs_to_micros(window));
            if let Some(existing) =
                index::find_duplicate(tx, resolved.project.id, resolved.sender.id, &key, since)?
            {
                let message = index::get_message(tx, resolved.project.id, existing)?;
                return Ok((resolved.project.slug, message, true));
            }
        }
        let id = index::insert_message(
            tx,
            &NewMessage {
                project_id: resolved.project.id,
                sender_id: resolved.sender.id,
                thread_id: thread_id.clone(),
                subject: subject.clone(),
                body_md: req.body_md.clone(),
                importance: req.importance,
                ack_required: req.ack_required,
                created_ts: now,
                dedupe_key: key.clone(),
                recipients: resolved.recipients.iter().map(|(a, k)| (a.id, *k)).collect(),
            },
        )?;
        registry::touch_agent(tx, resolved.sender.id, now)?;
        let message = index::get_message(tx, resolved.project.id, id)?;
        Ok((resolved.project.slug, message, false))
    })?;

    if deduplicated {
        tracing::debug!(project = %slug, id = message.id, "duplicate send collapsed onto existing message");
        // Rewriting identical documents is a no-op commit, and repairs an earlier degraded mirror.
        let durability = mirror_message(store, &slug, &message);
        return Ok(Committed::new(SendReceipt { message, deduplicated }, durability));
    }

    tracing::debug!(
        project = %slug,
        id = message.id,
        sender = %message.sender,
        recipients = message.recipients.len(),
        "message committed to index"
    );
    let durability = mirror_message(store, &slug, &message);
    Ok(Committed::new(SendReceipt { message, deduplicated }, durability))
}

fn reply_subject(original: &str, max_chars: usize) -> String {
    let trimmed = original.trim();
    let subject = if trimmed
        .get(..3)
        .is_some_and(|p| p.eq_ignore_ascii_case("re:"))
    {
        trimmed.to_string()
    } else {
        format!("Re: {}", trimmed)
    };
    subject.chars().take(max_chars).collect()
}

/// Reply within the original's thread. Recipients default to the original
/// sender and the subject gains a single `Re: ` prefix.
pub fn reply_message(store: &Store, req: &ReplyRequest) -> Result<Committed<SendReceipt>, MailError> {
    let original = store.pool().with_read(|conn| {
        let project = registry::find_project(conn, &req.project)?;
        registry::find_active_agent(conn, project.id, &req.sender)?;
        index::get_message(conn, project.id, req.message_id)
    })?;
    let send = SendRequest {
        project: req.project.clone(),
        sender: req.sender.clone(),
        to: req.to.clone().unwrap_or_else(|| vec![original.sender.clone()]),
        cc: req.cc.clone(),
        bcc: Vec::new(),
        subject: reply_subject(&original.subject, store.config.delivery.max_subject_chars),
        body_md: req.body_md.clone(),
        importance: req.importance.unwrap_or(original.importance),
        ack_required: req.ack_required,
        thread_id: Some(original.thread_key.clone()),
        idempotency_key: req.idempotency_key.clone(),
    };
    send_message(store, &send)
}

/// Snapshot read of an agent's inbox. Never touches archive locks.
pub fn fetch_inbox(
    store: &Store,
    project_key: &str,
    agent: &str,
    query: &InboxQuery,
) -> Result<Vec<InboxItem>, MailError> {
    store.pool().with_read(|conn| {
        let project = registry::find_project(conn, project_key)?;
        let me = registry::find_agent(conn, project.id, agent)?;
        index::fetch_inbox(conn, project.id, me.id, query)
    })
}

pub fn get_message(store: &Store, project_key: &str, message_id: i64) -> Result<MessageRecord, MailError> {
    store.pool().with_read(|conn| {
        let project = registry::find_project(conn, project_key)?;
        index::get_message(conn, project.id, message_id)
    })
}

/// Messages sharing `thread_key`, oldest first.
pub fn get_thread(store: &Store, project_key: &str, thread_key: &str) -> Result<Vec<MessageRecord>, MailError> {
    let messages = store.pool().with_read(|conn| {
        let project = registry::find_project(conn, project_key)?;
        index::thread_messages(conn, project.id, thread_key)
    })?;
    if messages.is_empty() {
        return Err(MailError::not_found("thread", thread_key));
    }
    Ok(messages)
}

pub fn search_messages(store: &Store, query: &SearchQuery) -> Result<Vec<SearchHit>, MailError> {
    store.pool().with_read(|conn| index::search_messages(conn, query))
}

#[derive(Clone, Copy)]
enum Receipt {
    Read,
    Acknowledged,
}

fn record_receipt(
    store: &Store,
    project_key: &str,
    agent: &str,
    message_id: i64,
    receipt: Receipt,
) -> Result<Committed<RecipientState>, MailError> {
    let now = time::now_micros();
    let (slug, message, name, state) = store.pool().with_transaction(|tx| {
        let project = registry::find_project(tx, project_key)?;
        let me = registry::find_agent(tx, project.id, agent)?;
        let message = index::get_message(tx, project.id, message_id)?;
        let state = match receipt {
            Receipt::Read => index::mark_read(tx, message_id, me.id, now),
            Receipt::Acknowledged => index::mark_acknowledged(tx, message_id, me.id, now),
        }
        .map_err(|err| match err {
            MailError::NotFound { .. } => MailError::not_found(
                "recipient",
                format!("{} is not a recipient of message {}", me.name, message_id),
            ),
            other => other,
        })?;
        if state.changed {
            registry::touch_agent(tx, me.id, now)?;
        }
        Ok((project.slug, message, me.name, state))
    })?;

    if !state.changed {
        return Ok(Committed::new(state, archive::current_durability(store)));
    }
    let doc = ReceiptDocument {
        message_id,
        agent: &name,
        read: state.read_ts.map(time::to_rfc3339),
        acknowledged: state.ack_ts.map(time::to_rfc3339),
    };
    let verb = match receipt {
        Receipt::Read => "read",
        Receipt::Acknowledged => "ack",
    };
    let durability = archive::mirror(
        store,
        &slug,
        &format!("receipt: {} {} {}", name, verb, message_id),
        |lock| {
            archive::write_json_document(
                lock,
                archive::receipt_path(message.created_ts, &message.subject, message.id, &name),
                &doc,
            )?;
            Ok(())
        },
    );
    if durability.is_degraded() {
        tracing::warn!(project = %slug, message_id, agent = %name, "receipt not mirrored");
    }
    Ok(Committed::new(state, durability))
}

/// Mark a message read for `agent`. Idempotent; the first read time is kept.
pub fn mark_read(
    store: &Store,
    project_key: &str,
    agent: &str,
    message_id: i64,
) -> Result<Committed<RecipientState>, MailError> {
    record_receipt(store, project_key, agent, message_id, Receipt::Read)
}

/// Acknowledge a message (also marks it read). Idempotent.
pub fn acknowledge(
    store: &Store,
    project_key: &str,
    agent: &str,
    message_id: i64,
) -> Result<Committed<RecipientState>, MailError> {
    record_receipt(store, project_key, agent, message_id, Receipt::Acknowledged)
}
