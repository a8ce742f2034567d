//! Application configuration using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. built-in defaults
//! 2. a TOML file (`colorcal.toml` unless another path is given)
//! 3. environment variables prefixed with `COLORCAL_`, nested with `__`
//!
//! # Example
//! ```toml
//! [instrument]
//! port = "/dev/ttyUSB0"
//!
//! [logging]
//! level = "debug"
//! format = "compact"
//!
//! [session.calibration]
//! correction_path = "wled-ips.ccmx.json"
//! ```
//!
//! `COLORCAL_SESSION__TRANSPORT__TIMEOUT_MS=2000` overrides a single value.

use crate::logging::LoggingConfig;
use anyhow::{bail, Context, Result};
use colorcal_core::data::InstrumentType;
use colorcal_hardware::config::SessionSettings;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "colorcal.toml";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Which instrument to open.
    pub instrument: InstrumentConfig,
    /// Log output.
    pub logging: LoggingConfig,
    /// Session tunables passed to the hardware layer.
    pub session: SessionSettings,
}

/// Instrument selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Device path used when the command line gives none: a serial path, a
    /// `/dev/serial/by-id` name, `usb` or `usb:VVVV:PPPP`.
    #[serde(default = "default_port")]
    pub port: String,
    /// Skip probing and open this family directly.
    #[serde(default)]
    pub kind: Option<InstrumentType>,
}

fn default_port() -> String {
    "usb".to_string()
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            kind: None,
        }
    }
}

impl AppConfig {
    /// Load from [`DEFAULT_CONFIG_FILE`] and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load from a specific file and the environment. A missing file is not
    /// an error; defaults apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config: AppConfig = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("COLORCAL_").split("__"))
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section.
    pub fn validate(&self) -> Result<()> {
        if self.instrument.port.trim().is_empty() {
            bail!("instrument.port must not be empty");
        }
        self.logging.validate()?;
        self.session
            .validate()
            .context("Invalid [session] configuration")?;
        Ok(())
    }
}
