//! Configuration Loader
//!
//! Environment-aware configuration loading. Sources are layered, later ones
//! overriding earlier ones:
//!
//! 1. built-in defaults
//! 2. `<dir>/docbus.toml`
//! 3. `<dir>/docbus.<environment>.toml`
//! 4. environment variables `DOCBUS_<SECTION>__<KEY>` (e.g. `DOCBUS_MESSAGING__WINDOW_SIZE`)

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use config::{Config, Environment, File, FileFormat};
use tracing::{debug, info};

use super::error::ConfigResult;
use super::DocbusConfig;

const BASE_FILE_STEM: &str = "docbus";
const ENV_PREFIX: &str = "DOCBUS";

/// Loaded configuration plus where it came from
#[derive(Debug)]
pub struct ConfigManager {
    config: DocbusConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment.
    /// Useful for tests that must not touch process environment variables.
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(|| PathBuf::from("config"));

        debug!(
            environment = %environment,
            directory = %config_directory.display(),
            "Loading docbus configuration"
        );

        let config = Self::build(&config_directory, environment)?;
        config.validate()?;

        info!(
            environment = %environment,
            queue_name = %config.messaging.queue_name,
            window_size = config.messaging.window_size,
            backend = ?config.store.backend,
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Wrap an already constructed configuration
    pub fn from_config(config: DocbusConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: Self::detect_environment(),
            config_directory: PathBuf::from("config"),
        }))
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &DocbusConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// Current environment from `DOCBUS_ENV`, defaulting to `development`
    pub fn detect_environment() -> String {
        env::var("DOCBUS_ENV").unwrap_or_else(|_| "development".to_string())
    }

    fn build(directory: &Path, environment: &str) -> ConfigResult<DocbusConfig> {
        let base = directory.join(format!("{BASE_FILE_STEM}.toml"));
        let overlay = directory.join(format!("{BASE_FILE_STEM}.{environment}.toml"));

        let settings = Config::builder()
            .add_source(File::from(base).format(FileFormat::Toml).required(false))
            .add_source(File::from(overlay).format(FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize::<DocbusConfig>()?)
    }
}
