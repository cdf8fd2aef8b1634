//! Configuration error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Failed to load configuration from {source_name}: {message}")]
    LoadError {
        source_name: String,
        message: String,
    },

    #[error("Invalid value for {field}: {value} ({reason})")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required configuration: {field}")]
    MissingField { field: String },
}

impl ConfigurationError {
    pub fn load_error(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LoadError {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    pub fn invalid_value(
        field: impl Into<String>,
        value: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }
}

impl From<config::ConfigError> for ConfigurationError {
    fn from(err: config::ConfigError) -> Self {
        ConfigurationError::load_error("config", err.to_string())
    }
}

pub type ConfigResult<T> = Result<T, ConfigurationError>;
