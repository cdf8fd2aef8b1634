//! # Docbus Configuration
//!
//! Layered configuration for the messaging engine, the store backend and
//! retry behavior. Every section deserializes with defaults, so a partial file
//! (or none at all) still yields a complete, validated configuration.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use docbus::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let window = manager.config().messaging.window_size;
//! let poll_every = manager.config().messaging.poll_interval();
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

use crate::constants::DEFAULT_QUEUE_NAME;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DocbusConfig {
    /// Engine behavior
    pub messaging: MessagingConfig,

    /// Store backend selection and connection settings
    pub store: StoreConfig,

    /// Retry policy for idempotent store operations
    pub retry: RetryConfig,
}

impl DocbusConfig {
    /// Validate all sections
    pub fn validate(&self) -> ConfigResult<()> {
        self.messaging.validate()?;
        self.store.validate()?;
        self.retry.validate()?;
        Ok(())
    }
}

/// Messaging engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Message collection name; locks live in `<queue_name>_lck`
    pub queue_name: String,

    /// Node identity; generated when absent
    pub node_id: Option<String>,

    /// Upper bound on locally queued plus in-flight messages
    pub window_size: usize,

    /// Interval between fallback polls
    pub poll_interval_ms: u64,

    /// Idle time when the local window is saturated
    pub pause_poll_interval_ms: u64,

    /// Run listeners on a bounded worker pool; when false everything runs inline
    pub multithreaded: bool,

    /// Worker pool size when multithreaded
    pub worker_threads: usize,

    /// Subscribe to store change notifications when the backend supports them
    pub use_change_feed: bool,

    /// Synthesize an acknowledgement when a listener returns no answer
    pub auto_answer: bool,

    /// Register the status info listener on construction
    pub status_info_enabled: bool,

    /// Lock lifetime for messages that do not time out
    pub default_lock_ttl_ms: u64,

    /// How often unanswered async callbacks are swept
    pub callback_sweep_interval_ms: u64,

    /// Capacity of the change feed's recently-seen id set
    pub seen_ids_capacity: usize,

    /// How often expired messages and locks are purged
    pub expiry_sweep_interval_ms: u64,

    /// Grace period for in-flight work during terminate
    pub shutdown_timeout_ms: u64,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            node_id: None,
            window_size: 100,
            poll_interval_ms: 1_000,
            pause_poll_interval_ms: 250,
            multithreaded: true,
            worker_threads: 10,
            use_change_feed: true,
            auto_answer: false,
            status_info_enabled: true,
            default_lock_ttl_ms: 30_000,
            callback_sweep_interval_ms: 1_000,
            seen_ids_capacity: 10_000,
            expiry_sweep_interval_ms: 60_000,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl MessagingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn pause_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pause_poll_interval_ms)
    }

    pub fn default_lock_ttl(&self) -> Duration {
        Duration::from_millis(self.default_lock_ttl_ms)
    }

    pub fn callback_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.callback_sweep_interval_ms)
    }

    pub fn expiry_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.expiry_sweep_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if !is_valid_queue_name(&self.queue_name) {
            return Err(ConfigurationError::invalid_value(
                "messaging.queue_name",
                &self.queue_name,
                "must start with a letter or underscore and contain only [A-Za-z0-9_]",
            ));
        }
        if let Some(node_id) = &self.node_id {
            if node_id.trim().is_empty() {
                return Err(ConfigurationError::invalid_value(
                    "messaging.node_id",
                    node_id,
                    "must not be blank",
                ));
            }
        }
        if self.window_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "messaging.window_size",
                self.window_size,
                "must be greater than zero",
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "messaging.poll_interval_ms",
                self.poll_interval_ms,
                "must be greater than zero",
            ));
        }
        if self.multithreaded && self.worker_threads == 0 {
            return Err(ConfigurationError::invalid_value(
                "messaging.worker_threads",
                self.worker_threads,
                "must be greater than zero when multithreaded",
            ));
        }
        if self.seen_ids_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "messaging.seen_ids_capacity",
                self.seen_ids_capacity,
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Queue names end up in table names for SQL backends
pub fn is_valid_queue_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 48 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Which store implementation backs the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    InMemory,
    Postgres,
}

/// Store configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub database_url: Option<String>,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::InMemory,
            database_url: None,
            max_connections: 10,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.backend == StoreBackend::Postgres && self.database_url.is_none() {
            return Err(ConfigurationError::missing_field("store.database_url"));
        }
        if self.max_connections == 0 {
            return Err(ConfigurationError::invalid_value(
                "store.max_connections",
                self.max_connections,
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Backoff configuration for retrying idempotent store operations
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,

    /// Initial backoff delay in milliseconds
    pub initial_delay_ms: u64,

    /// Maximum backoff delay in milliseconds
    pub max_delay_ms: u64,

    /// Backoff multiplier for exponential backoff
    pub multiplier: f64,

    /// Maximum jitter percentage (0.0 to 1.0)
    pub jitter_percent: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 50,
            max_delay_ms: 2_000,
            multiplier: 2.0,
            jitter_percent: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "retry.max_attempts",
                self.max_attempts,
                "must be at least 1",
            ));
        }
        if self.multiplier < 1.0 {
            return Err(ConfigurationError::invalid_value(
                "retry.multiplier",
                self.multiplier,
                "must be >= 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_percent) {
            return Err(ConfigurationError::invalid_value(
                "retry.jitter_percent",
                self.jitter_percent,
                "must be within 0.0..=1.0",
            ));
        }
        Ok(())
    }
}
