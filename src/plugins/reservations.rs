//! Advisory file reservations (leases).
//!
//! A reservation claims an ordered set of path patterns for a time-to-live.
//! Exclusive requests are checked against other agents' live exclusive leases
//! using the component-prefix overlap rule in [`crate::core::paths`]; shared
//! requests are signals and never conflict. A lease whose `expires_ts` has
//! passed is expired everywhere, whether or not a sweep has run yet.

use crate::core::error::{ConflictDetail, MailError};
use crate::core::paths;
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::archive::{self, Committed, Durability};
use crate::plugins::registry;
use rusqlite::{Connection, Row, params};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    Active,
    Released,
    Expired,
}

impl ReservationState {
    fn from_row(stored: &str, expires_ts: i64, now: i64) -> Self {
        match stored {
            "released" => ReservationState::Released,
            "expired" => ReservationState::Expired,
            _ if expires_ts <= now => ReservationState::Expired,
            _ => ReservationState::Active,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: i64,
    pub project_id: i64,
    pub agent: String,
    pub paths: Vec<String>,
    pub exclusive: bool,
    pub reason: String,
    pub state: ReservationState,
    pub created_ts: i64,
    pub expires_ts: i64,
    pub released_ts: Option<i64>,
}

impl Reservation {
    pub fn is_active(&self) -> bool {
        self.state == ReservationState::Active
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveRequest {
    pub paths: Vec<String>,
    #[serde(default = "default_exclusive")]
    pub exclusive: bool,
    /// Falls back to `reservations.default_ttl_secs`.
    #[serde(default)]
    pub ttl_secs: Option<i64>,
    #[serde(default)]
    pub reason: String,
}

fn default_exclusive() -> bool {
    true
}

impl ReserveRequest {
    pub fn exclusive<S: Into<String>>(paths: impl IntoIterator<Item = S>, ttl_secs: i64) -> Self {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
            exclusive: true,
            ttl_secs: Some(ttl_secs),
            reason: String::new(),
        }
    }

    pub fn shared<S: Into<String>>(paths: impl IntoIterator<Item = S>, ttl_secs: i64) -> Self {
        Self {
            exclusive: false,
            ..Self::exclusive(paths, ttl_secs)
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseOutcome {
    pub reservation: Reservation,
    /// False when the lease was already released or expired.
    pub changed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReservationFilter {
    pub agent: Option<String>,
    /// Include released and expired leases.
    pub include_inactive: bool,
}

const RESERVATION_SELECT: &str = "SELECT r.id, r.project_id, a.name, r.exclusive, r.reason, r.state, r.created_ts, r.expires_ts, r.released_ts, r.agent_id
     FROM file_reservations r JOIN agents a ON a.id = r.agent_id";

struct ReservationRow {
    reservation: Reservation,
    agent_id: i64,
}

fn row_to_reservation(row: &Row<'_>, now: i64) -> rusqlite::Result<ReservationRow> {
    let state: String = row.get(5)?;
    let expires_ts: i64 = row.get(7)?;
    Ok(ReservationRow {
        reservation: Reservation {
            id: row.get(0)?,
            project_id: row.get(1)?,
            agent: row.get(2)?,
            paths: Vec::new(),
            exclusive: row.get::<_, i64>(3)? != 0,
            reason: row.get(4)?,
            state: ReservationState::from_row(&state, expires_ts, now),
            created_ts: row.get(6)?,
            expires_ts,
            released_ts: row.get(8)?,
        },
        agent_id: row.get(9)?,
    })
}

fn load_paths(conn: &Connection, reservation_id: i64) -> Result<Vec<String>, MailError> {
    let mut stmt = conn.prepare_cached(
        "SELECT pattern FROM file_reservation_paths WHERE reservation_id = ?1 ORDER BY position",
    )?;
    let paths = stmt
        .query_map(params![reservation_id], |r| r.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(paths)
}

fn query_reservations(
    conn: &Connection,
    where_clause: &str,
    args: &[&dyn rusqlite::ToSql],
    now: i64,
) -> Result<Vec<ReservationRow>, MailError> {
    let mut stmt = conn.prepare(&format!("{} WHERE {} ORDER BY r.id", RESERVATION_SELECT, where_clause))?;
    let mut rows = stmt
        .query_map(args, |row| row_to_reservation(row, now))?
        .collect::<Result<Vec<_>, _>>()?;
    for row in rows.iter_mut() {
        row.reservation.paths = load_paths(conn, row.reservation.id)?;
    }
    Ok(rows)
}

fn load_reservation(conn: &Connection, project_id: i64, id: i64, now: i64) -> Result<ReservationRow, MailError> {
    query_reservations(conn, "r.project_id = ?1 AND r.id = ?2", &[&project_id, &id], now)?
        .into_iter()
        .next()
        .ok_or_else(|| MailError::not_found("reservation", id.to_string()))
}

/// Flip lapsed `active` rows to `expired`. Scoped to one project when given.
fn expire_stale(conn: &Connection, project_id: Option<i64>, now: i64) -> Result<Vec<(i64, i64)>, MailError> {
    let mut stmt = conn.prepare(
        "UPDATE file_reservations SET state = 'expired'
         WHERE state = 'active' AND expires_ts <= ?1 AND (?2 IS NULL OR project_id = ?2)
         RETURNING project_id, id",
    )?;
    let ids = stmt
        .query_map(params![now, project_id], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<Result<Vec<(i64, i64)>, _>>()?;
    Ok(ids)
}

fn resolve_ttl(store: &Store, requested: Option<i64>) -> Result<i64, MailError> {
    let cfg = &store.config.reservations;
    let ttl = requested.unwrap_or(cfg.default_ttl_secs);
    if ttl < 0 {
        return Err(MailError::ValidationError(format!(
            "ttl_secs must not be negative (got {})",
            ttl
        )));
    }
    if ttl > cfg.max_ttl_secs {
        return Err(MailError::ValidationError(format!(
            "ttl_secs {} exceeds the maximum of {}",
            ttl, cfg.max_ttl_secs
        )));
    }
    Ok(ttl)
}

fn validate_paths(store: &Store, raw: &[String]) -> Result<Vec<String>, MailError> {
    if raw.is_empty() {
        return Err(MailError::ValidationError(
            "a reservation needs at least one path".to_string(),
        ));
    }
    if raw.len() > store.config.reservations.max_paths {
        return Err(MailError::ValidationError(format!(
            "a reservation may hold at most {} paths",
            store.config.reservations.max_paths
        )));
    }
    for pattern in raw {
        if pattern.trim().is_empty() {
            return Err(MailError::ValidationError(
                "reservation paths must not be empty".to_string(),
            ));
        }
        if paths::normalize_pattern(pattern).is_empty() {
            return Err(MailError::ValidationError(format!(
                "reservation path '{}' does not name anything inside the project",
                pattern
            )));
        }
    }
    Ok(paths::normalize_pattern_set(raw))
}

fn find_conflicts(
    conn: &Connection,
    project_id: i64,
    agent_id: i64,
    requested: &[String],
    now: i64,
) -> Result<Vec<ConflictDetail>, MailError> {
    let held = query_reservations(
        conn,
        "r.project_id = ?1 AND r.agent_id != ?2 AND r.state = 'active' AND r.exclusive = 1 AND r.expires_ts > ?3",
        &[&project_id, &agent_id, &now],
        now,
    )?;
    let mut conflicts = Vec::new();
    for row in &held {
        for held_pattern in &row.reservation.paths {
            for wanted in requested {
                if paths::patterns_overlap(wanted, held_pattern) {
                    conflicts.push(ConflictDetail {
                        requested: wanted.clone(),
                        held_pattern: held_pattern.clone(),
                        holder: row.reservation.agent.clone(),
                        reservation_id: row.reservation.id,
                        expires_ts: row.reservation.expires_ts,
                    });
                }
            }
        }
    }
    Ok(conflicts)
}

fn mirror_reservations(store: &Store, slug: &str, message: &str, reservations: &[Reservation]) -> Durability {
    if reservations.is_empty() {
        return archive::current_durability(store);
    }
    archive::mirror(store, slug, message, |lock| {
        for reservation in reservations {
            archive::write_json_document(lock, archive::reservation_path(reservation.id), reservation)?;
        }
        Ok(())
    })
}

fn reload_all(conn: &Connection, project_id: i64, ids: &[i64], now: i64) -> Result<Vec<Reservation>, MailError> {
    ids.iter()
        .map(|id| load_reservation(conn, project_id, *id, now).map(|r| r.reservation))
        .collect()
}

/// Claim `req.paths` for `agent`. All-or-nothing: any exclusive overlap with
/// another agent's live exclusive lease fails with every conflict listed.
pub fn reserve(
    store: &Store,
    project_key: &str,
    agent: &str,
    req: &ReserveRequest,
) -> Result<Committed<Reservation>, MailError> {
    let patterns = validate_paths(store, &req.paths)?;
    let ttl = resolve_ttl(store, req.ttl_secs)?;
    let now = time::now_micros();

    let (slug, mut docs) = store.pool().with_transaction(|tx| {
        let project = registry::find_project(tx, project_key)?;
        let holder = registry::find_active_agent(tx, project.id, agent)?;
        let swept = expire_stale(tx, Some(project.id), now)?;

        if req.exclusive {
            let conflicts = find_conflicts(tx, project.id, holder.id, &patterns, now)?;
            if !conflicts.is_empty() {
                return Err(MailError::ReservationConflict { conflicts });
            }
        }

        tx.execute(
            "INSERT INTO file_reservations(project_id, agent_id, exclusive, reason, state, created_ts, expires_ts)
             VALUES(?1, ?2, ?3, ?4, 'active', ?5, ?6)",
            params![
                project.id,
                holder.id,
                req.exclusive,
                req.reason,
                now,
                now.saturating_add(time::secs_to_micros(ttl))
            ],
        )?;
        let id = tx.last_insert_rowid();
        for (position, pattern) in patterns.iter().enumerate() {
            tx.execute(
                "INSERT INTO file_reservation_paths(reservation_id, position, pattern) VALUES(?1, ?2, ?3)",
                params![id, position as i64, pattern],
            )?;
        }
        registry::touch_agent(tx, holder.id, now)?;

        let mut ids = vec![id];
        ids.extend(swept.iter().map(|(_, swept_id)| *swept_id));
        Ok((project.slug, reload_all(tx, project.id, &ids, now)?))
    })?;

    tracing::debug!(project = %slug, agent, paths = patterns.len(), exclusive = req.exclusive, "reservation granted");
    let durability = mirror_reservations(
        store,
        &slug,
        &format!("reservation: {} reserve {}", agent, patterns.join(", ")),
        &docs,
    );
    let granted = docs.swap_remove(0);
    Ok(Committed::new(granted, durability))
}

fn owned(row: ReservationRow, holder_id: i64, agent: &str) -> Result<Reservation, MailError> {
    if row.agent_id != holder_id {
        return Err(MailError::NotOwner {
            reservation_id: row.reservation.id,
            holder: row.reservation.agent,
            agent: agent.to_string(),
        });
    }
    Ok(row.reservation)
}

/// Extend a live lease: `expires_ts = max(now, expires_ts) + ttl`.
pub fn renew(
    store: &Store,
    project_key: &str,
    agent: &str,
    reservation_id: i64,
    ttl_secs: Option<i64>,
) -> Result<Committed<Reservation>, MailError> {
    let ttl = resolve_ttl(store, ttl_secs)?;
    let now = time::now_micros();
    let (slug, reservation) = store.pool().with_transaction(|tx| {
        let project = registry::find_project(tx, project_key)?;
        let holder = registry::find_agent(tx, project.id, agent)?;
        let current = owned(load_reservation(tx, project.id, reservation_id, now)?, holder.id, agent)?;
        if !current.is_active() {
            return Err(MailError::ValidationError(format!(
                "reservation {} is {:?} and cannot be renewed; reserve the paths again",
                reservation_id, current.state
            )));
        }
        let expires_ts = current
            .expires_ts
            .max(now)
            .saturating_add(time::secs_to_micros(ttl));
        tx.execute(
            "UPDATE file_reservations SET expires_ts = ?2 WHERE id = ?1",
            params![reservation_id, expires_ts],
        )?;
        registry::touch_agent(tx, holder.id, now)?;
        Ok((project.slug, load_reservation(tx, project.id, reservation_id, now)?.reservation))
    })?;
    let durability = mirror_reservations(
        store,
        &slug,
        &format!("reservation: {} renew {}", agent, reservation_id),
        std::slice::from_ref(&reservation),
    );
    Ok(Committed::new(reservation, durability))
}

/// Release a lease. Releasing an already released or expired lease succeeds
/// with `changed = false`.
pub fn release(
    store: &Store,
    project_key: &str,
    agent: &str,
    reservation_id: i64,
) -> Result<Committed<ReleaseOutcome>, MailError> {
    let now = time::now_micros();
    let (slug, outcome) = store.pool().with_transaction(|tx| {
        let project = registry::find_project(tx, project_key)?;
        let holder = registry::find_agent(tx, project.id, agent)?;
        let current = owned(load_reservation(tx, project.id, reservation_id, now)?, holder.id, agent)?;
        if !current.is_active() {
            return Ok((project.slug, ReleaseOutcome { reservation: current, changed: false }));
        }
        tx.execute(
            "UPDATE file_reservations SET state = 'released', released_ts = ?2 WHERE id = ?1",
            params![reservation_id, now],
        )?;
        let reservation = load_reservation(tx, project.id, reservation_id, now)?.reservation;
        Ok((project.slug, ReleaseOutcome { reservation, changed: true }))
    })?;
    let durability = if outcome.changed {
        mirror_reservations(
            store,
            &slug,
            &format!("reservation: {} release {}", agent, reservation_id),
            std::slice::from_ref(&outcome.reservation),
        )
    } else {
        archive::current_durability(store)
    };
    Ok(Committed::new(outcome, durability))
}

/// Release every live lease of `agent`; with a non-empty `filter`, only those
/// with a pattern overlapping one of the filter paths.
pub fn release_all(
    store: &Store,
    project_key: &str,
    agent: &str,
    filter: &[String],
) -> Result<Committed<Vec<Reservation>>, MailError> {
    let now = time::now_micros();
    let filter = paths::normalize_pattern_set(filter);
    let (slug, released) = store.pool().with_transaction(|tx| {
        let project = registry::find_project(tx, project_key)?;
        let holder = registry::find_agent(tx, project.id, agent)?;
        let live = query_reservations(
            tx,
            "r.project_id = ?1 AND r.agent_id = ?2 AND r.state = 'active' AND r.expires_ts > ?3",
            &[&project.id, &holder.id, &now],
            now,
        )?;
        let mut ids = Vec::new();
        for row in live {
            let matches = filter.is_empty()
                || row
                    .reservation
                    .paths
                    .iter()
                    .any(|held| filter.iter().any(|f| paths::patterns_overlap(f, held)));
            if matches {
                tx.execute(
                    "UPDATE file_reservations SET state = 'released', released_ts = ?2 WHERE id = ?1",
                    params![row.reservation.id, now],
                )?;
                ids.push(row.reservation.id);
            }
        }
        Ok((project.slug, reload_all(tx, project.id, &ids, now)?))
    })?;
    let durability = mirror_reservations(
        store,
        &slug,
        &format!("reservation: {} release {} lease(s)", agent, released.len()),
        &released,
    );
    Ok(Committed::new(released, durability))
}

/// Transition every lapsed lease in every project to `expired` and mirror the
/// swept records. Returns how many were swept.
pub fn sweep_expired(store: &Store) -> Result<usize, MailError> {
    let now = time::now_micros();
    let by_project = store.pool().with_transaction(|tx| {
        let swept = expire_stale(tx, None, now)?;
        let mut grouped: BTreeMap<String, Vec<Reservation>> = BTreeMap::new();
        for (project_id, id) in swept {
            let slug: String = tx.query_row(
                "SELECT slug FROM projects WHERE id = ?1",
                params![project_id],
                |r| r.get(0),
            )?;
            let reservation = load_reservation(tx, project_id, id, now)?.reservation;
            grouped.entry(slug).or_default().push(reservation);
        }
        Ok(grouped)
    })?;

    let count = by_project.values().map(Vec::len).sum();
    for (slug, reservations) in &by_project {
        let durability = mirror_reservations(
            store,
            slug,
            &format!("reservation: sweep {} expired lease(s)", reservations.len()),
            reservations,
        );
        if durability.is_degraded() {
            tracing::warn!(project = %slug, "expired reservations not mirrored");
        }
    }
    tracing::info!(expired = count, projects = by_project.len(), "reservation sweep complete");
    Ok(count)
}

pub fn list_reservations(
    store: &Store,
    project_key: &str,
    filter: &ReservationFilter,
) -> Result<Vec<Reservation>, MailError> {
    let now = time::now_micros();
    store.pool().with_read(|conn| {
        let project = registry::find_project(conn, project_key)?;
        let agent_id = match &filter.agent {
            Some(name) => Some(registry::find_agent(conn, project.id, name)?.id),
            None => None,
        };
        let rows = query_reservations(
            conn,
            "r.project_id = ?1 AND (?2 IS NULL OR r.agent_id = ?2)
             AND (?3 OR (r.state = 'active' AND r.expires_ts > ?4))",
            &[&project.id, &agent_id, &filter.include_inactive, &now],
            now,
        )?;
        Ok(rows.into_iter().map(|r| r.reservation).collect())
    })
}

pub fn get_reservation(store: &Store, project_key: &str, id: i64) -> Result<Reservation, MailError> {
    let now = time::now_micros();
    store.pool().with_read(|conn| {
        let project = registry::find_project(conn, project_key)?;
        Ok(load_reservation(conn, project.id, id, now)?.reservation)
    })
}

/// Whether leases of `a` and `b` with overlapping patterns were both live at
/// some point in `[window_start, now]`. Shared and exclusive leases both count.
pub fn overlapping_active(
    conn: &Connection,
    project_id: i64,
    a: i64,
    b: i64,
    window_start: i64,
    now: i64,
) -> Result<bool, MailError> {
    let live_in_window = "r.project_id = ?1 AND r.agent_id = ?2 AND r.created_ts <= ?4
         AND MIN(r.expires_ts, COALESCE(r.released_ts, r.expires_ts)) >= ?3";
    let mine = query_reservations(conn, live_in_window, &[&project_id, &a, &window_start, &now], now)?;
    if mine.is_empty() {
        return Ok(false);
    }
    let theirs = query_reservations(conn, live_in_window, &[&project_id, &b, &window_start, &now], now)?;
    Ok(mine.iter().any(|x| {
        theirs.iter().any(|y| {
            x.reservation
                .paths
                .iter()
                .any(|p| y.reservation.paths.iter().any(|q| paths::patterns_overlap(p, q)))
        })
    }))
}
