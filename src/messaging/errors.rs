//! # Messaging Error Types
//!
//! Structured error handling for the messaging engine and store adapters using
//! thiserror. Local recoverable conditions (lock conflicts, rejections,
//! eligibility skips) never surface here; they are dispatcher outcomes.

use thiserror::Error;

use crate::config::ConfigurationError;

/// Messaging error types
#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("Store operation failed: {operation}: {message}")]
    Store { operation: String, message: String },

    #[error("Store connection error: {message}")]
    StoreConnection { message: String },

    #[error("Duplicate key in {collection}: {id}")]
    DuplicateKey { collection: String, id: String },

    #[error("Record not found: {id}")]
    NotFound { id: String },

    #[error("Invalid message: {field}: {reason}")]
    InvalidMessage { field: String, reason: String },

    #[error("Timeout: operation {operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Configuration error: {component}: {message}")]
    Configuration { component: String, message: String },

    #[error("Change feed error: {message}")]
    ChangeFeed { message: String },

    #[error("Messaging is not running")]
    NotRunning,

    #[error("Messaging is shutting down")]
    ShuttingDown,

    #[error("Internal messaging error: {message}")]
    Internal { message: String },
}

impl MessagingError {
    /// Create a store operation error
    pub fn store(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a store connection error
    pub fn store_connection(message: impl Into<String>) -> Self {
        Self::StoreConnection {
            message: message.into(),
        }
    }

    /// Create a duplicate key error
    pub fn duplicate_key(collection: impl Into<String>, id: impl ToString) -> Self {
        Self::DuplicateKey {
            collection: collection.into(),
            id: id.to_string(),
        }
    }

    /// Create a not found error
    pub fn not_found(id: impl ToString) -> Self {
        Self::NotFound { id: id.to_string() }
    }

    /// Create an invalid message error
    pub fn invalid_message(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidMessage {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Create a change feed error
    pub fn change_feed(message: impl Into<String>) -> Self {
        Self::ChangeFeed {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the error is a transient store/network failure worth retrying.
    ///
    /// Only idempotent operations are ever retried; sends are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Store { .. } | Self::StoreConnection { .. } | Self::Timeout { .. }
        )
    }

    /// Whether this error reports a uniqueness violation
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, Self::DuplicateKey { .. })
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for MessagingError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => MessagingError::not_found("row"),
            sqlx::Error::Database(db_err) => {
                if db_err.is_unique_violation() {
                    MessagingError::duplicate_key(
                        db_err.table().unwrap_or("unknown").to_string(),
                        db_err.constraint().unwrap_or("primary key"),
                    )
                } else {
                    MessagingError::store("database", db_err.to_string())
                }
            }
            sqlx::Error::PoolTimedOut => MessagingError::timeout("database_pool", 30_000),
            sqlx::Error::PoolClosed => MessagingError::store_connection("Database pool is closed"),
            sqlx::Error::Configuration(config_err) => {
                MessagingError::configuration("database", config_err.to_string())
            }
            sqlx::Error::Io(io_err) => MessagingError::store_connection(io_err.to_string()),
            _ => MessagingError::store("database", err.to_string()),
        }
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        MessagingError::serialization(err.to_string())
    }
}

impl From<ConfigurationError> for MessagingError {
    fn from(err: ConfigurationError) -> Self {
        MessagingError::configuration("config", err.to_string())
    }
}

impl From<config::ConfigError> for MessagingError {
    fn from(err: config::ConfigError) -> Self {
        MessagingError::configuration("config", err.to_string())
    }
}

/// Result type alias for messaging operations
pub type MessagingResult<T> = Result<T, MessagingError>;
