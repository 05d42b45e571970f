//! CLI struct definitions for the `mailroom` maintenance command.
//!
//! All clap-derived types live here. Dispatch lives in `lib.rs`.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "mailroom",
    version = env!("CARGO_PKG_VERSION"),
    about = "Maintenance and inspection for a mailroom store: expiry sweeps, lock healing, inbox and search."
)]
pub(crate) struct Cli {
    /// Store root (holds mailroom.toml, index.db and archive/).
    #[clap(long, global = true, default_value = ".")]
    pub root: PathBuf,
    /// Output format.
    #[clap(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Create the store layout and, optionally, a project.
    Init {
        /// Project human key to register (e.g. an absolute repository path).
        #[clap(long)]
        project: Option<String>,
    },
    /// Expire lapsed file reservations in every project (run from cron).
    Sweep,
    /// Archive lock maintenance.
    Locks {
        #[clap(subcommand)]
        command: LocksCommand,
    },
    /// Show an agent's inbox, newest first.
    Inbox {
        #[clap(long)]
        project: String,
        #[clap(long)]
        agent: String,
        #[clap(long)]
        unread: bool,
        #[clap(long)]
        urgent: bool,
        #[clap(long)]
        limit: Option<usize>,
        /// Include message bodies.
        #[clap(long)]
        bodies: bool,
    },
    /// Full-text search over subjects and bodies.
    Search {
        text: String,
        #[clap(long)]
        project: Option<String>,
        /// Sender or recipient name.
        #[clap(long)]
        agent: Option<String>,
        #[clap(long)]
        thread: Option<String>,
        #[clap(long)]
        limit: Option<usize>,
    },
    /// Agents and live reservations of a project.
    Status {
        #[clap(long)]
        project: String,
    },
}

#[derive(Subcommand, Debug)]
pub(crate) enum LocksCommand {
    /// Reclaim lock files older than `archive.stale_lock_secs`.
    Heal,
}
