//! `colorcal-hardware`
//!
//! Everything between the wire and a calibrated reading: links and protocol
//! codecs, the device families, auto-probe, calibration negotiation, the
//! stabilization engine, the persistent calibration cache, the trigger-switch
//! poller and the [`Instrument`] session that ties them together.
//!
//! ## Features
//!
//! - `serial` (default): serial ports via `tokio-serial`
//! - `usb` (default): USB instruments via `nusb`
//!
//! Without either feature only the simulated instrument and in-memory links
//! are available.

pub mod cache;
pub mod config;
pub mod correction;
pub mod drivers;
pub mod negotiation;
pub mod poller;
pub mod port_resolver;
pub mod probe;
pub mod session;
pub mod stabilize;
pub mod transport;

pub use cache::{CalibrationCache, PersistedCalibration};
pub use config::SessionSettings;
pub use correction::CorrectionMatrix;
pub use drivers::{Driver, SimulationScript};
pub use negotiation::NegotiationSummary;
pub use poller::SwitchEvent;
pub use probe::{probe, LinkOpener, SystemOpener};
pub use session::Instrument;
