//! Agent configuration loading and validation.
//!
//! The top-level [`Config`] aggregates the logger settings and the
//! enumeration settings. It is read once from a TOML file at startup and
//! shared read-only afterwards.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use validator::Validate;

use self::{enumerations::EnumerationsConfig, logger::LoggerConfig};

pub mod enumerations;
pub mod logger;

/// Environment variable overriding the configuration file location.
pub const CONFIG_ENV: &str = "BLAZEBEE_PAL_CONFIG";

/// Configuration file used when [`CONFIG_ENV`] is not set.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/blazebee-pal/config.toml";

/// Timestamp prefix for messages printed before the tracing subscriber exists.
#[doc(hidden)]
pub fn early_timestamp() -> String {
    time::OffsetDateTime::now_utc()
        .format(time::macros::format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
        ))
        .unwrap_or_default()
}

/// Timestamped console messages for use before logging is initialized.
#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::early_timestamp()).dim(),
            console::style("INFO").green(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::early_timestamp()).dim(),
            console::style("WARN").yellow(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => {
        eprintln!("{}  {} {}",
            console::style($crate::config::early_timestamp()).dim(),
            console::style("ERROR").red(),
            format_args!($($arg)*)
        );
    };
}

/// Errors raised while locating, reading, parsing or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error while reading configuration: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Top-level agent configuration.
#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub logger: LoggerConfig,

    /// Which enumerations run and how they read the host.
    #[validate(nested)]
    pub enumerations: EnumerationsConfig,
}

impl Config {
    /// Locates the configuration file and loads it.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if no file is found or it cannot be read,
    /// parsed or validated.
    pub fn new() -> Result<Self, ConfigError> {
        let path = Self::config_path(
            std::env::var(CONFIG_ENV).ok().as_deref(),
            Path::new(DEFAULT_CONFIG_PATH),
        )?;
        Self::load(&path)
    }

    /// Picks the configuration path.
    ///
    /// Priority:
    /// 1. the value of [`CONFIG_ENV`]
    /// 2. `fallback`, if it exists
    fn config_path(from_env: Option<&str>, fallback: &Path) -> Result<PathBuf, ConfigError> {
        if let Some(config_path) = from_env.filter(|p| !p.is_empty()) {
            let path = PathBuf::from(config_path);
            print_info!("Using config from {}: {}", CONFIG_ENV, path.display());
            return Ok(path);
        }

        if fallback.exists() {
            print_info!("Using default config path: {}", fallback.display());
            return Ok(fallback.to_path_buf());
        }

        Err(ConfigError::Config(format!(
            "No configuration file found; set {} or create {}",
            CONFIG_ENV,
            fallback.display()
        )))
    }

    /// Loads and validates configuration from `path`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::Config(format!(
                "{} does not exist",
                path.display()
            )));
        }

        let config_str = fs::read_to_string(path)?;
        Self::parse(&config_str)
    }

    /// Parses and validates a TOML document.
    pub fn parse(config_str: &str) -> Result<Config, ConfigError> {
        let config: Config =
            toml::from_str(config_str).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        Ok(config)
    }
}
