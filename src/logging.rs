//! # Structured Logging Module
//!
//! Environment-aware structured logging for the engine's background tasks.
//! Console output is human readable by default; `DOCBUS_LOG_FORMAT=json`
//! switches to one JSON object per line.

use std::sync::OnceLock;

use chrono::Utc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::messaging::message::Msg;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration.
///
/// Safe to call more than once; an already installed global subscriber is kept.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = std::env::var("DOCBUS_LOG").unwrap_or_else(|_| get_log_level(&environment));
        let json = std::env::var("DOCBUS_LOG_FORMAT")
            .map(|format| format.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let layer = if json {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(false)
                .json()
                .with_filter(EnvFilter::new(filter.clone()))
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true)
                .with_filter(EnvFilter::new(filter.clone()))
                .boxed()
        };

        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            filter = %filter,
            json = json,
            "Structured logging initialized"
        );
    });
}

/// Get current environment from `DOCBUS_ENV`
fn get_environment() -> String {
    std::env::var("DOCBUS_ENV").unwrap_or_else(|_| "development".to_string())
}

/// Default filter for an environment
fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        "test" => "warn".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log structured data for a message lifecycle event
pub fn log_message_operation(operation: &str, node_id: &str, msg: &Msg, status: &str) {
    tracing::debug!(
        operation = %operation,
        node_id = %node_id,
        msg_id = %msg.msg_id,
        topic = %msg.topic,
        sender = msg.sender.as_deref(),
        exclusive = msg.exclusive,
        answer = msg.is_answer(),
        status = %status,
        timestamp = %Utc::now().to_rfc3339(),
        "MESSAGE_OPERATION"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_levels_per_environment() {
        assert_eq!(get_log_level("production"), "info");
        assert_eq!(get_log_level("test"), "warn");
        assert_eq!(get_log_level("development"), "debug");
        assert_eq!(get_log_level("staging"), "debug");
    }

    #[test]
    fn test_init_is_idempotent() {
        init_structured_logging();
        init_structured_logging();
        let msg = Msg::new("t", "m", "v");
        log_message_operation("send", "node-a", &msg, "ok");
    }
}
