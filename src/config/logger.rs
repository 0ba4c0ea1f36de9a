//! `[logger]` section: level, console and journald outputs.

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Console output layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One line per event.
    #[default]
    Compact,
    /// Multi-line, human oriented.
    Pretty,
    /// One JSON object per event.
    Json,
}

/// How timestamps are rendered in log lines.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimestampFormat {
    /// RFC 3339 in UTC.
    #[default]
    Rfc3339,
    /// Epoch seconds with a microsecond fraction.
    Unix,
    /// A `time` format description, e.g. `[hour]:[minute]:[second]`.
    Custom(String),
}

/// The `[logger]` section.
///
/// Selects the level, the timestamp layout and which outputs are active.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggerConfig {
    /// One of trace, debug, info, warn, error (case-insensitive).
    ///
    /// `RUST_LOG` takes precedence when set.
    #[validate(custom(function = "validate_log_level"))]
    pub level: String,

    /// Console output; omitted means no console logging.
    #[validate(nested)]
    pub console: Option<ConsoleConfig>,

    /// systemd journal output; off unless configured.
    #[validate(nested)]
    pub journald: Option<JournaldConfig>,

    /// Timestamp layout of console lines.
    #[validate(custom(function = "validate_timestamp_format"))]
    pub timestamp_format: TimestampFormat,
}

/// Rejects a blank custom timestamp description.
fn validate_timestamp_format(format: &TimestampFormat) -> Result<(), ValidationError> {
    match format {
        TimestampFormat::Custom(s) if s.trim().is_empty() => {
            let mut err = ValidationError::new("invalid_timestamp_format");
            err.message = Some("Custom timestamp format cannot be empty".into());
            Err(err)
        }
        _ => Ok(()),
    }
}

/// Accepts the five `tracing` levels in any case.
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    match level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => {
            let mut err = ValidationError::new("invalid_log_level");
            err.message = Some(format!("Invalid log level: {}", level).into());
            Err(err)
        }
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            timestamp_format: TimestampFormat::default(),
            console: Some(ConsoleConfig::default()),
            journald: None,
        }
    }
}

/// The `[logger.console]` section.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Whether events are written to stdout.
    pub enabled: bool,
    /// Line layout.
    pub format: LogFormat,
    /// Print the event target (module path).
    pub show_target: bool,
    /// Print the id of the emitting thread.
    pub show_thread_ids: bool,
    /// Colour levels and fields with ANSI escapes.
    pub ansi_colors: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            format: LogFormat::default(),
            show_target: false,
            show_thread_ids: false,
            ansi_colors: true,
        }
    }
}

/// systemd journal output.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct JournaldConfig {
    /// Whether events are sent to the journal.
    pub enabled: bool,

    /// `SYSLOG_IDENTIFIER` of the journal entries.
    #[validate(length(min = 1, message = "Journald identifier must not be empty"))]
    pub identifier: String,
}

impl Default for JournaldConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            identifier: "blazebee-pal".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_case_insensitive() {
        for level in ["TRACE", "Debug", "info", "warn", "ERROR"] {
            assert!(validate_log_level(level).is_ok(), "{level}");
        }
        assert!(validate_log_level("verbose").is_err());
    }

    #[test]
    fn blank_custom_timestamp_is_rejected() {
        let config = LoggerConfig {
            timestamp_format: TimestampFormat::Custom("  ".into()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn sections_parse_from_toml() {
        let config: LoggerConfig = toml::from_str(
            r#"
            level = "warn"
            timestamp_format = "Unix"

            [console]
            format = "json"
            ansi_colors = false

            [journald]
            enabled = true
            "#,
        )
        .unwrap();

        assert_eq!(config.timestamp_format, TimestampFormat::Unix);
        let console = config.console.as_ref().unwrap();
        assert_eq!(console.format, LogFormat::Json);
        assert!(console.enabled);
        assert!(!console.ansi_colors);
        let journald = config.journald.as_ref().unwrap();
        assert!(journald.enabled);
        assert_eq!(journald.identifier, "blazebee-pal");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_journald_identifier_is_rejected() {
        let config = LoggerConfig {
            journald: Some(JournaldConfig {
                enabled: true,
                identifier: String::new(),
            }),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
