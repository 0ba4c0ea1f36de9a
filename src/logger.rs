//! Global `tracing` subscriber setup.
//!
//! [`LoggerManager`] validates the `[logger]` section and installs console
//! and journald layers. Enumeration log handles (see [`crate::core::log`])
//! emit plain `tracing` events, so everything they log flows through the
//! layers configured here.

use std::io;

use thiserror::Error;
use time::{format_description::OwnedFormatItem, format_description::well_known::Rfc3339, OffsetDateTime};
use tracing_subscriber::{
    fmt::{self, format::Writer, time::FormatTime},
    prelude::*,
    EnvFilter, Layer, Registry,
};
use validator::{Validate, ValidationErrors};

use crate::{
    config::logger::{ConsoleConfig, LogFormat, LoggerConfig, TimestampFormat},
    print_info, print_warn,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Failures while validating the logger section or installing the subscriber.
#[derive(Error, Debug)]
pub enum LoggerError {
    /// The global subscriber could not be installed, usually because one is
    /// already set.
    #[error("Logger initialization error: {0}")]
    InitializationError(String),

    /// `[logger]` failed its field validators.
    #[error("Logger configuration validation error: {0}")]
    ValidationError(#[from] ValidationErrors),

    /// A custom timestamp description that `time` cannot parse.
    #[error("Invalid timestamp format '{format}': {reason}")]
    InvalidTimestampFormat { format: String, reason: String },

    /// Journald socket failure.
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    /// Every output is disabled or failed to start.
    #[error("No logging layers were configured or successfully initialized")]
    NoLayersConfigured,

    /// Journald was requested next to console output and could not connect.
    #[error("Failed to initialize journald logger while console output is enabled")]
    JournaldFailedWithConsoleEnabled,
}

/// Timestamp renderer for console lines.
#[derive(Debug, Clone)]
pub enum LogTimer {
    /// UTC, e.g. `2024-05-01T12:00:00.123456Z`.
    Rfc3339,
    /// Seconds since the epoch with microseconds.
    Unix,
    /// A pre-parsed `time` format description.
    Custom(OwnedFormatItem),
}

impl LogTimer {
    /// Builds the renderer for a configured format.
    ///
    /// # Errors
    ///
    /// Returns `LoggerError::InvalidTimestampFormat` when a custom
    /// description does not parse.
    pub fn from_format(format: &TimestampFormat) -> Result<Self, LoggerError> {
        match format {
            TimestampFormat::Rfc3339 => Ok(Self::Rfc3339),
            TimestampFormat::Unix => Ok(Self::Unix),
            TimestampFormat::Custom(description) => {
                time::format_description::parse_owned::<2>(description)
                    .map(Self::Custom)
                    .map_err(|e| LoggerError::InvalidTimestampFormat {
                        format: description.clone(),
                        reason: e.to_string(),
                    })
            }
        }
    }
}

impl FormatTime for LogTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_utc();
        match self {
            Self::Unix => write!(w, "{}.{:06}", now.unix_timestamp(), now.microsecond()),
            Self::Rfc3339 => {
                let text = now.format(&Rfc3339).map_err(|_| std::fmt::Error)?;
                w.write_str(&text)
            }
            Self::Custom(items) => {
                let text = now.format(items).map_err(|_| std::fmt::Error)?;
                w.write_str(&text)
            }
        }
    }
}

/// Owns the validated logger configuration and installs the subscriber.
pub struct LoggerManager {
    config: LoggerConfig,
    timer: LogTimer,
}

impl LoggerManager {
    /// Validates `config` and its timestamp format.
    pub fn new(config: LoggerConfig) -> Result<Self, LoggerError> {
        config.validate()?;
        let timer = LogTimer::from_format(&config.timestamp_format)?;
        Ok(LoggerManager { config, timer })
    }

    /// `RUST_LOG` if set, otherwise the configured level.
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.config.level))
    }

    /// Installs the global subscriber. Call once at startup.
    ///
    /// # Errors
    ///
    /// Fails if no layer could be built, or if journald fails while console
    /// output is also requested.
    pub fn init(&mut self) -> Result<(), LoggerError> {
        let mut layers: Vec<BoxedLayer> = Vec::new();

        if let Some(console) = self.config.console.as_ref().filter(|c| c.enabled) {
            layers.push(self.console_layer(console));
        }

        if let Some(journald) = self.config.journald.as_ref().filter(|j| j.enabled) {
            match self.journald_layer(&journald.identifier) {
                Ok(layer) => {
                    layers.push(layer);
                    print_info!(
                        "Journald logger initialized with identifier: {}",
                        journald.identifier
                    );
                }
                Err(e) => {
                    print_warn!("Failed to initialize journald logger: {}", e);
                    if self.config.console.as_ref().is_some_and(|c| c.enabled) {
                        return Err(LoggerError::JournaldFailedWithConsoleEnabled);
                    }
                }
            }
        }

        if layers.is_empty() {
            print_warn!("No logging layers were initialized. Please check your configuration.");
            return Err(LoggerError::NoLayersConfigured);
        }

        tracing_subscriber::registry()
            .with(layers)
            .try_init()
            .map_err(|e| LoggerError::InitializationError(e.to_string()))
    }

    fn console_layer(&self, config: &ConsoleConfig) -> BoxedLayer {
        let base = fmt::layer()
            .with_target(config.show_target)
            .with_thread_ids(config.show_thread_ids)
            .with_ansi(config.ansi_colors)
            .with_timer(self.timer.clone())
            .with_writer(io::stdout);

        match config.format {
            LogFormat::Json => base.json().with_filter(self.filter()).boxed(),
            LogFormat::Pretty => base.pretty().with_filter(self.filter()).boxed(),
            LogFormat::Compact => base.compact().with_filter(self.filter()).boxed(),
        }
    }

    fn journald_layer(&self, identifier: &str) -> Result<BoxedLayer, LoggerError> {
        let layer = tracing_journald::layer()?.with_syslog_identifier(identifier.to_string());
        Ok(layer.with_filter(self.filter()).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::logger::JournaldConfig;

    fn render(timer: &LogTimer) -> String {
        let mut out = String::new();
        timer.format_time(&mut Writer::new(&mut out)).unwrap();
        out
    }

    #[test]
    fn invalid_level_is_rejected() {
        let config = LoggerConfig {
            level: "chatty".into(),
            ..Default::default()
        };
        assert!(matches!(
            LoggerManager::new(config),
            Err(LoggerError::ValidationError(_))
        ));
    }

    #[test]
    fn malformed_custom_timestamp_is_rejected() {
        let config = LoggerConfig {
            timestamp_format: TimestampFormat::Custom("[hour".into()),
            ..Default::default()
        };
        assert!(matches!(
            LoggerManager::new(config),
            Err(LoggerError::InvalidTimestampFormat { .. })
        ));
    }

    #[test]
    fn timers_render_each_format() {
        let unix = render(&LogTimer::Unix);
        let (secs, micros) = unix.split_once('.').unwrap();
        assert!(secs.parse::<i64>().unwrap() > 0);
        assert_eq!(micros.len(), 6);

        assert!(render(&LogTimer::Rfc3339).ends_with('Z'));

        let custom =
            LogTimer::from_format(&TimestampFormat::Custom("[year]".into())).unwrap();
        assert_eq!(render(&custom).len(), 4);
    }

    #[test]
    fn no_outputs_is_an_error() {
        let mut manager = LoggerManager::new(LoggerConfig {
            console: None,
            journald: Some(JournaldConfig::default()),
            ..Default::default()
        })
        .unwrap();
        assert!(matches!(manager.init(), Err(LoggerError::NoLayersConfigured)));
    }
}
