//! mailroom: a local-first coordination core for concurrent coding agents.
//!
//! Agents sharing a codebase use it to exchange mail-style messages, claim
//! files through advisory leases, and decide who may message whom.
//!
//! # Architecture
//!
//! ## Two-phase writes
//!
//! Every mutation commits to the SQLite index first (one `IMMEDIATE`
//! transaction, the durability boundary) and then mirrors human-readable
//! documents into a git working copy under `archive/`. The mirror is retried
//! and, failing that, reported as [`plugins::archive::Durability::ArchiveWriteDegraded`];
//! the index stays authoritative.
//!
//! ## Locks
//!
//! Archive writes take a per-project lock, then the commit lock, and release in
//! reverse. Both are RAII handles ([`core::lock::ProjectLock`],
//! [`core::lock::CommitLock`]) with an in-process half and an on-disk half, and
//! stale lock files are reclaimed.
//!
//! ## Subsystems (Plugins)
//!
//! - `registry`: projects and agents
//! - `archive`: the git-backed document mirror
//! - `index`: message rows, inbox reads and full-text search
//! - `reservations`: advisory file leases with overlap detection
//! - `contacts`: contact policies and the request/respond handshake
//! - `delivery`: send, reply, inbox, read and acknowledge
//!
//! # Examples
//!
//! ```bash
//! mailroom --root /srv/mailroom init --project /home/me/repo
//! mailroom --root /srv/mailroom sweep
//! mailroom --root /srv/mailroom locks heal
//! mailroom --root /srv/mailroom inbox --project /home/me/repo --agent BlueLake --unread
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: store handle, configuration, logging, index plumbing and locks
//! - [`plugins`]: the coordination subsystems

pub mod core;
pub mod plugins;

mod cli;

use crate::cli::{Cli, Command, LocksCommand, OutputFormat};
use crate::core::config::Config;
use crate::core::error::MailError;
use crate::core::logging;
use crate::core::store::Store;
use crate::plugins::index::{InboxQuery, SearchQuery};
use crate::plugins::reservations::ReservationFilter;
use crate::plugins::{delivery, registry, reservations};
use clap::Parser;
use serde::Serialize;

fn emit<T: Serialize>(format: OutputFormat, value: &T, text: impl FnOnce(&T)) -> Result<(), MailError> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Text => text(value),
    }
    Ok(())
}

/// Entry point for the `mailroom` binary.
pub fn run() -> Result<(), MailError> {
    let cli = Cli::parse();
    std::fs::create_dir_all(&cli.root)?;
    let config = Config::load(&cli.root)?;
    logging::init_logging(&config.logging)?;
    let store = Store::open_with_config(&cli.root, config)?;
    dispatch(&store, cli.format, cli.command)
}

fn dispatch(store: &Store, format: OutputFormat, command: Command) -> Result<(), MailError> {
    match command {
        Command::Init { project } => {
            let project = match project {
                Some(key) => Some(registry::ensure_project(store, &key)?),
                None => None,
            };
            emit(format, &project, |p| {
                println!("store ready at {}", store.root.display());
                if let Some(p) = p {
                    println!("project {} ({})", p.value.slug, p.value.human_key);
                }
            })
        }
        Command::Sweep => {
            let expired = reservations::sweep_expired(store)?;
            emit(format, &serde_json::json!({ "expired": expired }), |_| {
                println!("expired {} reservation(s)", expired)
            })
        }
        Command::Locks {
            command: LocksCommand::Heal,
        } => {
            let report = plugins::archive::heal_locks(store)?;
            emit(format, &report, |r| {
                println!("scanned {} lock file(s)", r.scanned);
                for path in &r.reclaimed {
                    println!("reclaimed {}", path.display());
                }
                for path in &r.held {
                    println!("held      {}", path.display());
                }
            })
        }
        Command::Inbox {
            project,
            agent,
            unread,
            urgent,
            limit,
            bodies,
        } => {
            let query = InboxQuery {
                unread_only: unread,
                urgent_only: urgent,
                since_ts: None,
                limit,
                include_bodies: bodies,
            };
            let items = delivery::fetch_inbox(store, &project, &agent, &query)?;
            emit(format, &items, |items| {
                for item in items {
                    let flag = if item.read_ts.is_some() { ' ' } else { '*' };
                    println!(
                        "{} #{:<6} {:<20} {:<8} {}",
                        flag,
                        item.id,
                        item.sender,
                        item.importance,
                        item.subject
                    );
                    if let Some(body) = &item.body_md {
                        println!("    {}", body.replace('\n', "\n    "));
                    }
                }
            })
        }
        Command::Search {
            text,
            project,
            agent,
            thread,
            limit,
        } => {
            let hits = delivery::search_messages(
                store,
                &SearchQuery {
                    text,
                    project,
                    agent,
                    thread,
                    limit,
                },
            )?;
            emit(format, &hits, |hits| {
                for hit in hits {
                    println!("#{:<6} {:<20} {}", hit.id, hit.sender, hit.subject);
                    println!("    {}", hit.snippet);
                }
            })
        }
        Command::Status { project } => {
            let agents = registry::list_agents(store, &project, true)?;
            let leases = reservations::list_reservations(store, &project, &ReservationFilter::default())?;
            let status = serde_json::json!({ "agents": agents, "reservations": leases });
            emit(format, &status, |_| {
                println!("agents:");
                for a in &agents {
                    println!(
                        "  {:<20} {:<14} {}{}",
                        a.name,
                        a.contact_policy,
                        a.program,
                        if a.active { "" } else { " (inactive)" }
                    );
                }
                println!("reservations:");
                for r in &leases {
                    println!(
                        "  #{:<5} {:<20} {:<9} {}",
                        r.id,
                        r.agent,
                        if r.exclusive { "exclusive" } else { "shared" },
                        r.paths.join(", ")
                    );
                }
            })
        }
    }
}
