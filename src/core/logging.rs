//! Structured logging via `tracing`.
//!
//! Library code only emits events; the binary decides where they go. Filter
//! precedence: `MAILROOM_LOG` (already folded into the config by
//! [`Config::load`](crate::core::config::Config::load)), then `logging.level`.

use crate::core::config::LoggingConfig;
use crate::core::error::MailError;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub fn build_env_filter(config: &LoggingConfig) -> Result<EnvFilter, MailError> {
    let directive = if config.level.trim().is_empty() {
        "info"
    } else {
        config.level.trim()
    };
    EnvFilter::try_new(directive)
        .map_err(|e| MailError::ConfigError(format!("invalid log filter '{}': {}", directive, e)))
}

/// Install the global subscriber. Logs go to stderr so stdout stays free for
/// command output. Calling this twice is an error reported by `try_init`.
pub fn init_logging(config: &LoggingConfig) -> Result<(), MailError> {
    let filter = build_env_filter(config)?;
    let base = Registry::default().with(filter);

    let result = if config.format == "json" {
        base.with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_timer(ChronoUtc::rfc_3339())
                .with_writer(std::io::stderr),
        )
        .try_init()
    } else {
        base.with(
            fmt::layer()
                .with_target(true)
                .with_timer(ChronoUtc::rfc_3339())
                .with_writer(std::io::stderr),
        )
        .try_init()
    };

    result.map_err(|e| MailError::ConfigError(format!("failed to install logger: {}", e)))
}
