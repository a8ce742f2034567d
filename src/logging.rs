//! Tracing initialisation.
//!
//! Library code logs through `tracing` with `colorcal::*` targets; this module
//! installs the subscriber for the binary. `RUST_LOG` takes precedence over the
//! configured level, so `RUST_LOG=colorcal::transport=trace` shows every wire
//! exchange without touching the config file.
//!
//! Output goes to stderr; stdout is reserved for readings.

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, coloured (development).
    Pretty,
    /// One line per event.
    #[default]
    Compact,
    /// Newline-delimited JSON (log aggregation).
    Json,
}

/// `[logging]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level: trace, debug, info, warn or error.
    #[serde(default = "default_level")]
    pub level: String,
    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
    /// Include source file and line.
    #[serde(default)]
    pub with_file_and_line: bool,
    /// ANSI colours (pretty and compact only).
    #[serde(default = "default_ansi")]
    pub with_ansi: bool,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_ansi() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
            with_file_and_line: false,
            with_ansi: default_ansi(),
        }
    }
}

impl LoggingConfig {
    /// Config at `level` with default formatting.
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            ..Default::default()
        }
    }

    /// Set the output format.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Reject unknown levels.
    pub fn validate(&self) -> Result<()> {
        if !LEVELS.contains(&self.level.to_lowercase().as_str()) {
            bail!(
                "Invalid log level '{}'. Must be one of: {}",
                self.level,
                LEVELS.join(", ")
            );
        }
        Ok(())
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.level.to_lowercase()))
    }
}

/// Install the global subscriber.
///
/// Idempotent: a second call, or a call after another subscriber was installed
/// (as in tests), returns `Ok(())`.
pub fn init(config: &LoggingConfig) -> Result<()> {
    config.validate()?;
    let filter = config.filter();
    let layer = match config.format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_writer(std::io::stderr)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_ansi(config.with_ansi)
            .with_filter(filter)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_ansi(config.with_ansi)
            .with_filter(filter)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_filter(filter)
            .boxed(),
    };

    match tracing_subscriber::registry().with(layer).try_init() {
        Ok(()) => Ok(()),
        Err(e) if already_set(&e) => Ok(()),
        Err(e) => Err(anyhow!("Failed to initialize tracing: {e}")),
    }
}

fn already_set(err: &tracing_subscriber::util::TryInitError) -> bool {
    err.to_string().contains("already been set")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_validation() {
        assert!(LoggingConfig::new("debug").validate().is_ok());
        assert!(LoggingConfig::new("WARN").validate().is_ok());
        assert!(LoggingConfig::new("verbose").validate().is_err());
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig::new("info").with_format(LogFormat::Json);
        assert!(init(&config).is_ok());
        assert!(init(&config).is_ok());
    }

    #[test]
    fn test_format_from_toml_name() {
        let config: LoggingConfig = serde_json::from_str(r#"{"format": "pretty"}"#).unwrap();
        assert_eq!(config.format, LogFormat::Pretty);
        assert_eq!(config.level, "info");
    }
}
