//! Contact policy engine.
//!
//! Decides whether a sender may message a recipient who has not opted in, and
//! runs the request/respond handshake that creates approved links.

use crate::core::config::ContactConfig;
use crate::core::error::MailError;
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::archive::{self, Committed};
use crate::plugins::registry::{self, Agent};
use crate::plugins::reservations;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactPolicy {
    /// Anyone in the project may write.
    Open,
    /// Strangers are admitted when there is evidence of prior collaboration.
    #[default]
    Auto,
    /// Only agents with an approved link may write.
    ContactsOnly,
    /// Nobody may write, approved links included.
    BlockAll,
}

impl ContactPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContactPolicy::Open => "open",
            ContactPolicy::Auto => "auto",
            ContactPolicy::ContactsOnly => "contacts_only",
            ContactPolicy::BlockAll => "block_all",
        }
    }

    /// Values read back from the index; anything unrecognised degrades to `Auto`.
    pub fn from_stored(raw: &str) -> Self {
        raw.parse().unwrap_or_else(|_| {
            tracing::warn!(policy = raw, "unknown stored contact policy, treating as auto");
            ContactPolicy::Auto
        })
    }
}

impl fmt::Display for ContactPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ContactPolicy {
    type Err = MailError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(ContactPolicy::Open),
            "auto" => Ok(ContactPolicy::Auto),
            "contacts_only" => Ok(ContactPolicy::ContactsOnly),
            "block_all" => Ok(ContactPolicy::BlockAll),
            other => Err(MailError::ValidationError(format!(
                "unknown contact policy '{}' (expected open, auto, contacts_only or block_all)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowReason {
    SelfMessage,
    Open,
    ApprovedLink,
    SharedThread,
    OverlappingReservations,
    RecentContact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    ContactBlocked,
    ContactRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum Admission {
    Allow(AllowReason),
    Reject(RejectReason),
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allow(_))
    }

    pub fn into_result(self, sender: &str, recipient: &str) -> Result<AllowReason, MailError> {
        match self {
            Admission::Allow(reason) => Ok(reason),
            Admission::Reject(RejectReason::ContactBlocked) => Err(MailError::ContactBlocked {
                sender: sender.to_string(),
                recipient: recipient.to_string(),
            }),
            Admission::Reject(RejectReason::ContactRequired) => Err(MailError::ContactRequired {
                sender: sender.to_string(),
                recipient: recipient.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Pending,
    Approved,
    Rejected,
}

impl LinkStatus {
    fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::Pending => "pending",
            LinkStatus::Approved => "approved",
            LinkStatus::Rejected => "rejected",
        }
    }

    fn from_stored(raw: &str) -> Self {
        match raw {
            "approved" => LinkStatus::Approved,
            "rejected" => LinkStatus::Rejected,
            _ => LinkStatus::Pending,
        }
    }
}

/// A directed contact link; `from` is the requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentLink {
    pub id: i64,
    pub from: String,
    pub to: String,
    pub status: LinkStatus,
    pub reason: String,
    pub created_ts: i64,
    pub updated_ts: i64,
    pub expires_ts: Option<i64>,
}

const LINK_SELECT: &str = "SELECT l.id, fa.name, ta.name, l.status, l.reason, l.created_ts, l.updated_ts, l.expires_ts
     FROM agent_links l
     JOIN agents fa ON fa.id = l.a_agent_id
     JOIN agents ta ON ta.id = l.b_agent_id";

fn link_from_row(row: &Row<'_>) -> rusqlite::Result<AgentLink> {
    let status: String = row.get(3)?;
    Ok(AgentLink {
        id: row.get(0)?,
        from: row.get(1)?,
        to: row.get(2)?,
        status: LinkStatus::from_stored(&status),
        reason: row.get(4)?,
        created_ts: row.get(5)?,
        updated_ts: row.get(6)?,
        expires_ts: row.get(7)?,
    })
}

fn find_link(conn: &Connection, project_id: i64, from_id: i64, to_id: i64) -> Result<Option<AgentLink>, MailError> {
    Ok(conn
        .query_row(
            &format!(
                "{} WHERE l.project_id = ?1 AND l.a_agent_id = ?2 AND l.b_agent_id = ?3",
                LINK_SELECT
            ),
            params![project_id, from_id, to_id],
            link_from_row,
        )
        .optional()?)
}

fn has_approved_link(conn: &Connection, project_id: i64, a: i64, b: i64, now: i64) -> Result<bool, MailError> {
    Ok(conn.query_row(
        "SELECT EXISTS(
            SELECT 1 FROM agent_links
            WHERE project_id = ?1 AND status = 'approved'
              AND (expires_ts IS NULL OR expires_ts > ?4)
              AND ((a_agent_id = ?2 AND b_agent_id = ?3) OR (a_agent_id = ?3 AND b_agent_id = ?2)))",
        params![project_id, a, b, now],
        |r| r.get(0),
    )?)
}

fn shares_thread(conn: &Connection, project_id: i64, a: i64, b: i64, since: i64) -> Result<bool, MailError> {
    Ok(conn.query_row(
        "WITH participants AS (
            SELECT COALESCE(m.thread_id, CAST(m.id AS TEXT)) AS thread_key, m.sender_id AS agent_id
            FROM messages m WHERE m.project_id = ?1 AND m.created_ts >= ?4
            UNION
            SELECT COALESCE(m.thread_id, CAST(m.id AS TEXT)), r.agent_id
            FROM messages m JOIN message_recipients r ON r.message_id = m.id
            WHERE m.project_id = ?1 AND m.created_ts >= ?4
        )
        SELECT EXISTS(
            SELECT 1 FROM participants pa JOIN participants pb ON pa.thread_key = pb.thread_key
            WHERE pa.agent_id = ?2 AND pb.agent_id = ?3)",
        params![project_id, a, b, since],
        |r| r.get(0),
    )?)
}

fn recent_exchange(conn: &Connection, project_id: i64, a: i64, b: i64, since: i64) -> Result<bool, MailError> {
    Ok(conn.query_row(
        "SELECT EXISTS(
            SELECT 1 FROM messages m JOIN message_recipients r ON r.message_id = m.id
            WHERE m.project_id = ?1 AND m.created_ts >= ?4
              AND ((m.sender_id = ?2 AND r.agent_id = ?3) OR (m.sender_id = ?3 AND r.agent_id = ?2)))",
        params![project_id, a, b, since],
        |r| r.get(0),
    )?)
}

/// Admission decision for `sender` writing to `recipient`. Pure read.
pub fn evaluate(
    conn: &Connection,
    cfg: &ContactConfig,
    sender: &Agent,
    recipient: &Agent,
    now: i64,
) -> Result<Admission, MailError> {
    if sender.id == recipient.id {
        return Ok(Admission::Allow(AllowReason::SelfMessage));
    }
    let project_id = recipient.project_id;
    match recipient.contact_policy {
        ContactPolicy::BlockAll => return Ok(Admission::Reject(RejectReason::ContactBlocked)),
        ContactPolicy::Open => return Ok(Admission::Allow(AllowReason::Open)),
        ContactPolicy::ContactsOnly | ContactPolicy::Auto => {}
    }
    if has_approved_link(conn, project_id, sender.id, recipient.id, now)? {
        return Ok(Admission::Allow(AllowReason::ApprovedLink));
    }
    if recipient.contact_policy == ContactPolicy::ContactsOnly {
        return Ok(Admission::Reject(RejectReason::ContactRequired));
    }

    // Message-derived trust only counts inside the recency window.
    let recent_since = now.saturating_sub(time::secs_to_micros(cfg.recent_ttl_secs));
    if recent_exchange(conn, project_id, sender.id, recipient.id, recent_since)? {
        return Ok(Admission::Allow(AllowReason::RecentContact));
    }
    if shares_thread(conn, project_id, sender.id, recipient.id, recent_since)? {
        return Ok(Admission::Allow(AllowReason::SharedThread));
    }
    let window_start = now.saturating_sub(time::secs_to_micros(cfg.reservation_window_secs));
    if reservations::overlapping_active(conn, project_id, sender.id, recipient.id, window_start, now)? {
        return Ok(Admission::Allow(AllowReason::OverlappingReservations));
    }
    Ok(Admission::Reject(RejectReason::ContactRequired))
}

/// Read-only admission check by name, for callers that want to know before
/// sending.
pub fn check_admission(
    store: &Store,
    project_key: &str,
    sender: &str,
    recipient: &str,
) -> Result<Admission, MailError> {
    store.pool().with_read(|conn| {
        let project = registry::find_project(conn, project_key)?;
        let from = registry::find_active_agent(conn, project.id, sender)?;
        let to = registry::find_active_agent(conn, project.id, recipient)?;
        evaluate(conn, &store.config.contact, &from, &to, time::now_micros())
    })
}

fn mirror_link(store: &Store, slug: &str, link: &AgentLink) -> archive::Durability {
    archive::mirror(
        store,
        slug,
        &format!("contact: {} -> {} {}", link.from, link.to, link.status.as_str()),
        |lock| {
            archive::write_json_document(lock, archive::contact_path(&link.from, &link.to), link)?;
            Ok(())
        },
    )
}

/// Ask `to` for permission to write. An already-approved link stays approved.
pub fn request_contact(
    store: &Store,
    project_key: &str,
    from: &str,
    to: &str,
    reason: &str,
) -> Result<Committed<AgentLink>, MailError> {
    let now = time::now_micros();
    let (slug, link) = store.pool().with_transaction(|tx| {
        let project = registry::find_project(tx, project_key)?;
        let requester = registry::find_active_agent(tx, project.id, from)?;
        let target = registry::find_active_agent(tx, project.id, to)?;
        if requester.id == target.id {
            return Err(MailError::ValidationError(
                "an agent cannot request contact with itself".to_string(),
            ));
        }
        if target.contact_policy == ContactPolicy::BlockAll {
            return Err(MailError::ContactBlocked {
                sender: requester.name,
                recipient: target.name,
            });
        }
        tx.execute(
            "INSERT INTO agent_links(project_id, a_agent_id, b_agent_id, status, reason, created_ts, updated_ts)
             VALUES(?1, ?2, ?3, 'pending', ?4, ?5, ?5)
             ON CONFLICT(project_id, a_agent_id, b_agent_id) DO UPDATE SET
                status = CASE
                    WHEN agent_links.status = 'approved'
                         AND (agent_links.expires_ts IS NULL OR agent_links.expires_ts > excluded.updated_ts)
                    THEN 'approved' ELSE 'pending' END,
                reason = excluded.reason,
                updated_ts = excluded.updated_ts",
            params![project.id, requester.id, target.id, reason, now],
        )?;
        let link = find_link(tx, project.id, requester.id, target.id)?
            .ok_or_else(|| MailError::not_found("contact_request", format!("{} -> {}", from, to)))?;
        Ok((project.slug, link))
    })?;
    let durability = mirror_link(store, &slug, &link);
    Ok(Committed::new(link, durability))
}

/// `responder` approves or rejects the pending request from `requester`.
/// Approvals expire after `ttl_secs` (or `contact.default_link_ttl_secs` when
/// that is non-zero); otherwise they never expire.
pub fn respond_contact(
    store: &Store,
    project_key: &str,
    responder: &str,
    requester: &str,
    accept: bool,
    ttl_secs: Option<i64>,
) -> Result<Committed<AgentLink>, MailError> {
    if ttl_secs.is_some_and(|t| t < 0) {
        return Err(MailError::ValidationError("ttl_secs must not be negative".to_string()));
    }
    let now = time::now_micros();
    let default_ttl = store.config.contact.default_link_ttl_secs;
    let (slug, link) = store.pool().with_transaction(|tx| {
        let project = registry::find_project(tx, project_key)?;
        let to = registry::find_active_agent(tx, project.id, responder)?;
        let from = registry::find_agent(tx, project.id, requester)?;
        let existing = find_link(tx, project.id, from.id, to.id)?.ok_or_else(|| {
            MailError::not_found("contact_request", format!("{} -> {}", requester, responder))
        })?;
        let (status, expires_ts) = if accept {
            let ttl = ttl_secs.or((default_ttl > 0).then_some(default_ttl));
            (
                LinkStatus::Approved,
                ttl.map(|t| now.saturating_add(time::secs_to_micros(t))),
            )
        } else {
            (LinkStatus::Rejected, None)
        };
        tx.execute(
            "UPDATE agent_links SET status = ?2, expires_ts = ?3, updated_ts = ?4 WHERE id = ?1",
            params![existing.id, status.as_str(), expires_ts, now],
        )?;
        let link = find_link(tx, project.id, from.id, to.id)?
            .ok_or_else(|| MailError::not_found("contact_request", format!("{} -> {}", requester, responder)))?;
        Ok((project.slug, link))
    })?;
    tracing::debug!(from = %link.from, to = %link.to, status = link.status.as_str(), "contact response recorded");
    let durability = mirror_link(store, &slug, &link);
    Ok(Committed::new(link, durability))
}

/// Every link the agent is on either end of, newest first.
pub fn list_contacts(store: &Store, project_key: &str, agent: &str) -> Result<Vec<AgentLink>, MailError> {
    store.pool().with_read(|conn| {
        let project = registry::find_project(conn, project_key)?;
        let me = registry::find_agent(conn, project.id, agent)?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE l.project_id = ?1 AND (l.a_agent_id = ?2 OR l.b_agent_id = ?2)
             ORDER BY l.updated_ts DESC, l.id DESC",
            LINK_SELECT
        ))?;
        let links = stmt
            .query_map(params![project.id, me.id], link_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(links)
    })
}
