//! Runtime configuration.
//!
//! Loaded from `<root>/mailroom.toml` when present; every field has a default so a
//! missing file is not an error. A handful of operational knobs can be overridden
//! through `MAILROOM_*` environment variables, which win over the file.

use crate::core::error::MailError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const CONFIG_FILE_NAME: &str = "mailroom.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub archive: ArchiveConfig,
    pub index: IndexConfig,
    pub reservations: ReservationConfig,
    pub contact: ContactConfig,
    pub delivery: DeliveryConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Upper bound on waiting for a project or commit lock.
    pub lock_timeout_ms: u64,
    /// A lock older than this is presumed abandoned and reclaimed.
    pub stale_lock_secs: u64,
    /// Mirror attempts after the index commit before reporting degraded.
    pub mirror_retries: u32,
    pub retry_base_ms: u64,
    pub git_author_name: String,
    pub git_author_email: String,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 60_000,
            stale_lock_secs: 180,
            mirror_retries: 3,
            retry_base_ms: 50,
            git_author_name: "mailroom".to_string(),
            git_author_email: "mailroom@localhost".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub busy_timeout_ms: u64,
    pub max_busy_retries: u32,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            max_busy_retries: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReservationConfig {
    pub default_ttl_secs: i64,
    pub max_ttl_secs: i64,
    pub max_paths: usize,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 3_600,
            max_ttl_secs: 7 * 24 * 3_600,
            max_paths: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContactConfig {
    /// `auto` admits senders who exchanged a message with the recipient this recently.
    pub recent_ttl_secs: i64,
    /// `auto` admits senders whose leases overlapped the recipient's this recently.
    pub reservation_window_secs: i64,
    /// Lifetime of an approved link when the responder gives none; 0 means no expiry.
    pub default_link_ttl_secs: i64,
}

impl Default for ContactConfig {
    fn default() -> Self {
        Self {
            recent_ttl_secs: 7 * 24 * 3_600,
            reservation_window_secs: 3_600,
            default_link_ttl_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Identical sends within this window are collapsed onto the first one.
    pub dedupe_window_secs: i64,
    pub max_subject_chars: usize,
    pub max_recipients: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            dedupe_window_secs: 300,
            max_subject_chars: 200,
            max_recipients: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive: `trace`, `debug`, `info`, `warn`, `error`, or an EnvFilter string.
    pub level: String,
    /// `text` or `json`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl Config {
    /// Load `<root>/mailroom.toml` (if any) and apply environment overrides.
    pub fn load(root: &Path) -> Result<Config, MailError> {
        let config_path = root.join(CONFIG_FILE_NAME);
        let mut config = if config_path.exists() {
            let content = fs::read_to_string(&config_path).map_err(MailError::IoError)?;
            Self::from_toml_str(&content)?
        } else {
            Config::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Config, MailError> {
        toml::from_str(content).map_err(|e| MailError::ConfigError(e.to_string()))
    }

    /// Overlay `MAILROOM_*` variables. The lookup is injected so tests do not
    /// have to mutate the process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), MailError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("MAILROOM_LOCK_TIMEOUT_MS") {
            self.archive.lock_timeout_ms = parse_env("MAILROOM_LOCK_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("MAILROOM_STALE_LOCK_SECS") {
            self.archive.stale_lock_secs = parse_env("MAILROOM_STALE_LOCK_SECS", &v)?;
        }
        if let Some(v) = lookup("MAILROOM_MIRROR_RETRIES") {
            self.archive.mirror_retries = parse_env("MAILROOM_MIRROR_RETRIES", &v)?;
        }
        if let Some(v) = lookup("MAILROOM_CONTACT_RECENT_TTL_SECS") {
            self.contact.recent_ttl_secs = parse_env("MAILROOM_CONTACT_RECENT_TTL_SECS", &v)?;
        }
        if let Some(v) = lookup("MAILROOM_LOG") {
            if !v.trim().is_empty() {
                self.logging.level = v;
            }
        }
        if let Some(v) = lookup("MAILROOM_LOG_FORMAT") {
            self.logging.format = v;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), MailError> {
        if self.archive.lock_timeout_ms == 0 {
            return Err(MailError::ConfigError(
                "archive.lock_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.reservations.default_ttl_secs < 0 || self.reservations.max_ttl_secs < 0 {
            return Err(MailError::ConfigError(
                "reservation TTLs must not be negative".to_string(),
            ));
        }
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(MailError::ConfigError(format!(
                "logging.format must be 'text' or 'json', got '{}'",
                self.logging.format
            )));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, MailError> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| MailError::ConfigError(format!("{} has an invalid value '{}'", key, raw)))
}
