//! Identity registry: projects and the agents registered in them.
//!
//! A project is addressed by its human key (typically an absolute repository
//! path) or by the slug derived from it. Agents are never hard-deleted; they
//! are deactivated and can be re-registered.

use crate::core::error::MailError;
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::archive::{self, Committed};
use crate::plugins::contacts::ContactPolicy;
use regex::Regex;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

static AGENT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").unwrap());

const SLUG_BASE_MAX: usize = 48;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub slug: String,
    pub human_key: String,
    pub created_ts: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub program: String,
    pub model: String,
    pub task_description: String,
    pub contact_policy: ContactPolicy,
    pub active: bool,
    pub inception_ts: i64,
    pub last_active_ts: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterAgent {
    pub name: String,
    pub program: String,
    pub model: String,
    #[serde(default)]
    pub task_description: String,
    #[serde(default)]
    pub contact_policy: Option<ContactPolicy>,
}

/// `<base>-<10 hex of sha256(human_key)>`; the base is the slugified key cut to
/// 48 characters.
pub fn project_slug(human_key: &str) -> String {
    let digest = Sha256::digest(human_key.as_bytes());
    let hex = format!("{:x}", digest);
    let base = archive::slugify(human_key, SLUG_BASE_MAX);
    if base.is_empty() {
        format!("project-{}", &hex[..10])
    } else {
        format!("{}-{}", base, &hex[..10])
    }
}

pub fn validate_agent_name(name: &str) -> Result<(), MailError> {
    if AGENT_NAME.is_match(name) {
        Ok(())
    } else {
        Err(MailError::ValidationError(format!(
            "agent name '{}' must be 1-64 characters of [A-Za-z0-9_-] starting with a letter or digit",
            name
        )))
    }
}

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        slug: row.get(1)?,
        human_key: row.get(2)?,
        created_ts: row.get(3)?,
    })
}

pub(crate) const AGENT_COLUMNS: &str = "id, project_id, name, program, model, task_description, contact_policy, active, inception_ts, last_active_ts";

pub(crate) fn agent_from_row(row: &Row<'_>) -> rusqlite::Result<Agent> {
    let policy: String = row.get(6)?;
    Ok(Agent {
        id: row.get(0)?,
        project_id: row.get(1)?,
        name: row.get(2)?,
        program: row.get(3)?,
        model: row.get(4)?,
        task_description: row.get(5)?,
        contact_policy: ContactPolicy::from_stored(&policy),
        active: row.get::<_, i64>(7)? != 0,
        inception_ts: row.get(8)?,
        last_active_ts: row.get(9)?,
    })
}

/// Look a project up by human key or slug.
pub fn find_project(conn: &Connection, key: &str) -> Result<Project, MailError> {
    conn.query_row(
        "SELECT id, slug, human_key, created_ts FROM projects WHERE human_key = ?1 OR slug = ?1",
        params![key],
        project_from_row,
    )
    .optional()?
    .ok_or_else(|| MailError::not_found("project", key))
}

pub fn get_project(store: &Store, key: &str) -> Result<Project, MailError> {
    store.pool().with_read(|conn| find_project(conn, key))
}

pub fn find_agent(conn: &Connection, project_id: i64, name: &str) -> Result<Agent, MailError> {
    conn.query_row(
        &format!(
            "SELECT {} FROM agents WHERE project_id = ?1 AND name = ?2",
            AGENT_COLUMNS
        ),
        params![project_id, name],
        agent_from_row,
    )
    .optional()?
    .ok_or_else(|| MailError::not_found("agent", name))
}

/// Like [`find_agent`] but a deactivated agent counts as missing.
pub fn find_active_agent(conn: &Connection, project_id: i64, name: &str) -> Result<Agent, MailError> {
    let agent = find_agent(conn, project_id, name)?;
    if agent.active {
        Ok(agent)
    } else {
        Err(MailError::not_found("agent", name))
    }
}

pub fn find_agent_by_id(conn: &Connection, agent_id: i64) -> Result<Agent, MailError> {
    conn.query_row(
        &format!("SELECT {} FROM agents WHERE id = ?1", AGENT_COLUMNS),
        params![agent_id],
        agent_from_row,
    )
    .optional()?
    .ok_or_else(|| MailError::not_found("agent", agent_id.to_string()))
}

pub fn get_agent(store: &Store, project_key: &str, name: &str) -> Result<Agent, MailError> {
    store.pool().with_read(|conn| {
        let project = find_project(conn, project_key)?;
        find_agent(conn, project.id, name)
    })
}

pub fn touch_agent(conn: &Connection, agent_id: i64, ts: i64) -> Result<(), MailError> {
    conn.execute(
        "UPDATE agents SET last_active_ts = MAX(last_active_ts, ?2) WHERE id = ?1",
        params![agent_id, ts],
    )?;
    Ok(())
}

fn mirror_project(store: &Store, project: &Project) -> archive::Durability {
    archive::mirror(
        store,
        &project.slug,
        &format!("project: {}", project.slug),
        |lock| {
            archive::write_json_document(lock, archive::PROJECT_DOC, project)?;
            Ok(())
        },
    )
}

fn mirror_profile(store: &Store, slug: &str, agent: &Agent, action: &str) -> archive::Durability {
    archive::mirror(
        store,
        slug,
        &format!("agent: {} {}", action, agent.name),
        |lock| {
            archive::write_json_document(lock, archive::profile_path(&agent.name), agent)?;
            Ok(())
        },
    )
}

/// Create the project for `human_key` if needed. Idempotent: the same key
/// always maps to the same row and slug.
pub fn ensure_project(store: &Store, human_key: &str) -> Result<Committed<Project>, MailError> {
    let human_key = human_key.trim();
    if human_key.is_empty() {
        return Err(MailError::ValidationError(
            "project key must not be empty".to_string(),
        ));
    }
    let slug = project_slug(human_key);
    let project = store.pool().with_transaction(|tx| {
        tx.execute(
            "INSERT INTO projects(slug, human_key, created_ts) VALUES(?1, ?2, ?3)
             ON CONFLICT(human_key) DO NOTHING",
            params![slug, human_key, time::now_micros()],
        )?;
        find_project(tx, human_key)
    })?;
    let durability = mirror_project(store, &project);
    Ok(Committed::new(project, durability))
}

/// Register `req.name` in the project, or re-activate and update an existing
/// registration (names compare case-insensitively; the stored casing wins).
pub fn register_agent(
    store: &Store,
    project_key: &str,
    req: &RegisterAgent,
) -> Result<Committed<Agent>, MailError> {
    let name = req.name.trim();
    validate_agent_name(name)?;
    let now = time::now_micros();
    let (project, agent) = store.pool().with_transaction(|tx| {
        let project = find_project(tx, project_key)?;
        let policy = req.contact_policy.unwrap_or_default().to_string();
        tx.execute(
            "INSERT INTO agents(project_id, name, program, model, task_description, contact_policy, active, inception_ts, last_active_ts)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?7)
             ON CONFLICT(project_id, name) DO UPDATE SET
                program = excluded.program,
                model = excluded.model,
                task_description = excluded.task_description,
                active = 1,
                last_active_ts = excluded.last_active_ts",
            params![project.id, name, req.program, req.model, req.task_description, policy, now],
        )?;
        if let Some(explicit) = req.contact_policy {
            tx.execute(
                "UPDATE agents SET contact_policy = ?3 WHERE project_id = ?1 AND name = ?2",
                params![project.id, name, explicit.to_string()],
            )?;
        }
        let agent = find_agent(tx, project.id, name)?;
        Ok((project, agent))
    })?;
    tracing::debug!(project = %project.slug, agent = %agent.name, "registered agent");
    let durability = mirror_profile(store, &project.slug, &agent, "register");
    Ok(Committed::new(agent, durability))
}

pub fn list_agents(
    store: &Store,
    project_key: &str,
    include_inactive: bool,
) -> Result<Vec<Agent>, MailError> {
    store.pool().with_read(|conn| {
        let project = find_project(conn, project_key)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM agents WHERE project_id = ?1 AND (?2 OR active = 1) ORDER BY name COLLATE NOCASE",
            AGENT_COLUMNS
        ))?;
        let agents = stmt
            .query_map(params![project.id, include_inactive], agent_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(agents)
    })
}

pub fn deactivate_agent(
    store: &Store,
    project_key: &str,
    name: &str,
) -> Result<Committed<Agent>, MailError> {
    let (project, agent) = store.pool().with_transaction(|tx| {
        let project = find_project(tx, project_key)?;
        let agent = find_agent(tx, project.id, name)?;
        tx.execute("UPDATE agents SET active = 0 WHERE id = ?1", params![agent.id])?;
        Ok((project, find_agent_by_id(tx, agent.id)?))
    })?;
    let durability = mirror_profile(store, &project.slug, &agent, "deactivate");
    Ok(Committed::new(agent, durability))
}

pub fn set_contact_policy(
    store: &Store,
    project_key: &str,
    name: &str,
    policy: ContactPolicy,
) -> Result<Committed<Agent>, MailError> {
    let (project, agent) = store.pool().with_transaction(|tx| {
        let project = find_project(tx, project_key)?;
        let agent = find_agent(tx, project.id, name)?;
        tx.execute(
            "UPDATE agents SET contact_policy = ?2 WHERE id = ?1",
            params![agent.id, policy.to_string()],
        )?;
        Ok((project, find_agent_by_id(tx, agent.id)?))
    })?;
    let durability = mirror_profile(store, &project.slug, &agent, "policy");
    Ok(Committed::new(agent, durability))
}
