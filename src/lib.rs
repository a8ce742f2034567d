//! colorcal
//!
//! Command-line front end and application glue for the colorcal instrument
//! layer. The device-independent contract lives in [`colorcal_core`]; links,
//! drivers, calibration and measurement in [`colorcal_hardware`].
//!
//! This crate adds the layered application configuration ([`config`]),
//! tracing initialisation ([`logging`]) and a console calibration host
//! ([`host`]).

pub mod config;
pub mod host;
pub mod logging;

pub use colorcal_core as core;
pub use colorcal_hardware as hardware;

pub use config::AppConfig;
pub use host::ConsoleHost;
pub use logging::{LogFormat, LoggingConfig};
