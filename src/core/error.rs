use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// One overlap between a requested path and a lease held by another agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictDetail {
    pub requested: String,
    pub held_pattern: String,
    pub holder: String,
    pub reservation_id: i64,
    pub expires_ts: i64,
}

#[derive(Error, Debug)]
pub enum MailError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {kind} '{name}'")]
    NotFound { kind: &'static str, name: String },
    #[error("Lock timeout: {0}")]
    LockTimeout(String),
    #[error("Reservation conflict: {}", describe_conflicts(.conflicts))]
    ReservationConflict { conflicts: Vec<ConflictDetail> },
    #[error("Contact required: '{recipient}' does not accept unsolicited messages from '{sender}'; use request_contact first")]
    ContactRequired { sender: String, recipient: String },
    #[error("Contact blocked: '{recipient}' blocks all messages (sender '{sender}')")]
    ContactBlocked { sender: String, recipient: String },
    #[error("Not owner: reservation {reservation_id} is held by '{holder}', not '{agent}'")]
    NotOwner {
        reservation_id: i64,
        holder: String,
        agent: String,
    },
    #[error("History error: {0}")]
    HistoryError(String),
}

impl MailError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        MailError::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Stable machine-readable code for transports.
    pub fn code(&self) -> &'static str {
        match self {
            MailError::RusqliteError(_) => "DATABASE_ERROR",
            MailError::IoError(_) => "IO_ERROR",
            MailError::JsonError(_) => "SERIALIZATION_ERROR",
            MailError::ConfigError(_) => "CONFIG_ERROR",
            MailError::ValidationError(_) => "VALIDATION_ERROR",
            MailError::NotFound { .. } => "NOT_FOUND",
            MailError::LockTimeout(_) => "LOCK_TIMEOUT",
            MailError::ReservationConflict { .. } => "RESERVATION_CONFLICT",
            MailError::ContactRequired { .. } => "CONTACT_REQUIRED",
            MailError::ContactBlocked { .. } => "CONTACT_BLOCKED",
            MailError::NotOwner { .. } => "NOT_OWNER",
            MailError::HistoryError(_) => "HISTORY_ERROR",
        }
    }

    /// Busy/locked SQLite failures are worth retrying with backoff.
    pub fn is_busy(&self) -> bool {
        match self {
            MailError::RusqliteError(rusqlite::Error::SqliteFailure(code, _)) => matches!(
                code.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

fn describe_conflicts(conflicts: &[ConflictDetail]) -> String {
    conflicts
        .iter()
        .map(|c| {
            format!(
                "'{}' overlaps '{}' held by '{}' (reservation {})",
                c.requested, c.held_pattern, c.holder, c.reservation_id
            )
        })
        .collect::<Vec<_>>()
        .join("; ")
}
