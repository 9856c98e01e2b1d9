//! Orchestrator settings.
//!
//! Layered with figment:
//! - Default values
//! - Optional TOML file
//! - Environment variable overrides
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `RAPTURE_LINT_` and use double
//! underscores to separate nested levels:
//! - `RAPTURE_LINT_DEBOUNCE_MS=0` sets `debounce_ms`
//! - `RAPTURE_LINT_LOGGING__DEFAULT=debug` sets `logging.default`
//!
//! These settings configure the orchestrator itself. The per-project file
//! that declares sessions and rules is modelled in [`crate::configuration`].

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::ConfigError;

const ENV_PREFIX: &str = "RAPTURE_LINT_";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Settings {
    /// File name of the per-project configuration, looked up in each root
    #[serde(default = "default_config_file_name")]
    pub config_file_name: String,

    /// Quiet period before an added/changed file is read; 0 reads immediately
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// How often the event loop flushes debounced events
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Follow symlinks during the initial directory scan
    #[serde(default)]
    pub follow_links: bool,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Default level for every target
    #[serde(default = "default_log_level")]
    pub default: String,

    /// Per-target overrides, e.g. `rapture_lint::project = "debug"`
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

fn default_config_file_name() -> String {
    ".rapturelintrc".to_string()
}
fn default_debounce_ms() -> u64 {
    50
}
fn default_tick_ms() -> u64 {
    25
}
fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_file_name: default_config_file_name(),
            debounce_ms: default_debounce_ms(),
            tick_ms: default_tick_ms(),
            follow_links: false,
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: HashMap::new(),
        }
    }
}

impl Settings {
    /// Load settings from defaults and environment only.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::figment(None)
            .extract()
            .map_err(|e| ConfigError::Settings(Box::new(e)))
    }

    /// Load settings from a TOML file layered between defaults and environment.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::figment(Some(path.as_ref()))
            .extract()
            .map_err(|e| ConfigError::Settings(Box::new(e)))
    }

    fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        // Double underscore separates nested levels, single underscores stay
        figment.merge(
            Env::prefixed(ENV_PREFIX).map(|key| key.as_str().to_lowercase().replace("__", ".").into()),
        )
    }

    /// Save current settings as TOML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;

        Ok(())
    }
}
